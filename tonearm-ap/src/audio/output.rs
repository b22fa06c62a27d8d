//! Output graph assembly
//!
//! The playbin's audio sink is a small chain:
//!
//! ```text
//! queue -> volume -> fakesink                      (testoutput)
//! queue -> volume -> tee -> queue -> output bin    (one branch per output)
//! ```
//!
//! The leading queue buys time between about-to-finish and the actual
//! stream switch. Seeks are sent to it rather than to the playbin.

use crate::error::{Error, Result};
use crate::pipeline::{AudioSinkGraph, ElementRef, MediaEngine, Pipeline, PropertyValue};
use tonearm_common::config::AudioConfig;
use tracing::{debug, error, info, warn};

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Percentage view of a `volume` element
#[derive(Clone)]
pub struct VolumeControl {
    element: ElementRef,
}

impl VolumeControl {
    pub fn new(element: ElementRef) -> Self {
        Self { element }
    }

    /// Current volume, 0-100
    pub fn get_volume(&self) -> u8 {
        let linear = self
            .element
            .property("volume")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);
        (linear * 100.0).round().clamp(0.0, 100.0) as u8
    }

    /// Set volume from a percentage; values above 100 are clamped
    pub fn set_volume(&self, volume: u8) -> bool {
        let volume = volume.min(100);
        match self
            .element
            .set_property("volume", PropertyValue::Double(f64::from(volume) / 100.0))
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to set volume to {}: {}", volume, e);
                false
            }
        }
    }

    pub fn get_mute(&self) -> bool {
        self.element
            .property("mute")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn set_mute(&self, mute: bool) -> bool {
        match self.element.set_property("mute", PropertyValue::Bool(mute)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to set mute to {}: {}", mute, e);
                false
            }
        }
    }
}

/// Handles to the installed sink chain
pub struct OutputGraph {
    /// Sink-side queue, target of seeks
    pub queue: ElementRef,
    pub volume: VolumeControl,
}

/// Builds the sink chain from the audio configuration
pub struct OutputGraphBuilder<'a> {
    engine: &'a dyn MediaEngine,
    config: &'a AudioConfig,
}

impl<'a> OutputGraphBuilder<'a> {
    pub fn new(engine: &'a dyn MediaEngine, config: &'a AudioConfig) -> Self {
        Self { engine, config }
    }

    /// Build the chain and install it as the playbin's audio sink
    pub fn build(&self, playbin: &dyn Pipeline) -> Result<OutputGraph> {
        let queue = self.engine.make_element("queue", Some("sink-queue"))?;
        let volume = self.engine.make_element("volume", Some("sink-volume"))?;

        if let Some(buffer_time) = self.config.buffer_time.filter(|ms| *ms > 0) {
            let nanos = buffer_time.checked_mul(NANOS_PER_MILLI).ok_or_else(|| {
                Error::Config(format!("buffer_time of {} ms is out of range", buffer_time))
            })?;
            queue.set_property("max-size-time", PropertyValue::UInt(nanos))?;
            debug!("Sink queue limited to {} ms", buffer_time);
        }

        let mut elements = vec![queue.clone(), volume.clone()];

        let outputs = if self.config.uses_test_output() {
            if !self.config.extra_outputs.is_empty() {
                debug!("Ignoring extra outputs with testoutput");
            }
            let fakesink = self.engine.make_element("fakesink", Some("testoutput"))?;
            elements.push(fakesink.clone());
            fakesink
        } else {
            let tee = self.engine.make_element("tee", Some("output-tee"))?;
            elements.push(tee.clone());
            for description in self.config.outputs() {
                self.add_output(&tee, description, &mut elements)?;
            }
            tee
        };

        queue.link(&volume)?;
        volume.link(&outputs)?;

        playbin.set_audio_sink(AudioSinkGraph {
            entry: queue.clone(),
            elements,
        })?;

        Ok(OutputGraph {
            queue,
            volume: VolumeControl::new(volume),
        })
    }

    fn add_output(
        &self,
        tee: &ElementRef,
        description: &str,
        elements: &mut Vec<ElementRef>,
    ) -> Result<()> {
        let output = self.engine.parse_bin(description).map_err(|e| {
            error!("Failed to create audio output \"{}\": {}", description, e);
            Error::Output(format!("{}: {}", description, e))
        })?;

        let queue = self.engine.make_element("queue", None)?;
        tee.link(&queue)?;
        queue.link(&output)?;

        elements.push(queue);
        elements.push(output);
        info!("Audio output set to \"{}\"", description);
        Ok(())
    }

    /// Attach the configured visualizer
    ///
    /// Returns whether a visualizer is active. Failures only disable the
    /// feature.
    pub fn setup_visualizer(&self, playbin: &dyn Pipeline) -> bool {
        let Some(factory) = self.config.visualizer.as_deref() else {
            return false;
        };

        let attached = self
            .engine
            .make_element(factory, Some("visualizer"))
            .and_then(|vis| playbin.set_visualizer(vis));

        match attached {
            Ok(()) => {
                info!("Audio visualizer set to \"{}\"", factory);
                true
            }
            Err(e) => {
                warn!("Failed to create visualizer \"{}\", disabling: {}", factory, e);
                false
            }
        }
    }
}
