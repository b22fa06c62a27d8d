//! Mixers
//!
//! A mixer controls output volume and mute. The software mixer does so
//! through the `volume` element in the audio actor's sink chain, reached via
//! a [`SoftwareMixerAdapter`] the actor hands over once the chain exists.
//!
//! Mixers are looked up by name in the [`MixerRegistry`]. Built-in mixers
//! are registered explicitly with [`register_builtin_mixers`] at startup.

use crate::audio::output::VolumeControl;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tonearm_common::config::AudioConfig;
use tonearm_common::{ListenerRegistry, MixerEvent};
use tracing::{debug, info};

/// Volume and mute control
pub trait Mixer: Send + Sync {
    fn name(&self) -> &str;

    /// Volume 0-100, `None` when unknown
    fn get_volume(&self) -> Option<u8>;

    /// Returns whether the volume was applied
    fn set_volume(&self, volume: u8) -> bool;

    fn get_mute(&self) -> Option<bool>;

    fn set_mute(&self, mute: bool) -> bool;

    /// Volume and mute change notifications
    fn events(&self) -> &ListenerRegistry<MixerEvent>;

    fn trigger_volume_changed(&self, volume: u8) {
        debug!("Mixer event: volume_changed(volume={})", volume);
        self.events().send(MixerEvent::VolumeChanged { volume });
    }

    fn trigger_mute_changed(&self, mute: bool) {
        debug!("Mixer event: mute_changed(mute={})", mute);
        self.events().send(MixerEvent::MuteChanged { mute });
    }

    /// The software mixer, which needs the audio actor's volume element
    fn as_software(&self) -> Option<&SoftwareMixer> {
        None
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Binds a software mixer to the sink chain's volume element
pub struct SoftwareMixerAdapter {
    volume: VolumeControl,
    events: Arc<ListenerRegistry<MixerEvent>>,
}

impl SoftwareMixerAdapter {
    pub fn new(volume: VolumeControl, events: Arc<ListenerRegistry<MixerEvent>>) -> Self {
        Self { volume, events }
    }

    pub fn get_volume(&self) -> u8 {
        self.volume.get_volume()
    }

    pub fn set_volume(&self, volume: u8) -> bool {
        let applied = self.volume.set_volume(volume);
        if applied {
            let volume = self.get_volume();
            debug!("Mixer event: volume_changed(volume={})", volume);
            self.events.send(MixerEvent::VolumeChanged { volume });
        }
        applied
    }

    pub fn get_mute(&self) -> bool {
        self.volume.get_mute()
    }

    pub fn set_mute(&self, mute: bool) -> bool {
        let applied = self.volume.set_mute(mute);
        if applied {
            let mute = self.get_mute();
            debug!("Mixer event: mute_changed(mute={})", mute);
            self.events.send(MixerEvent::MuteChanged { mute });
        }
        applied
    }
}

#[derive(Default)]
struct SoftwareMixerState {
    adapter: Option<Arc<SoftwareMixerAdapter>>,
    initial_volume: Option<u8>,
    initial_mute: Option<bool>,
}

/// Mixer acting on the audio actor's software volume element
///
/// Volume and mute requested before [`SoftwareMixer::setup`] are remembered
/// and applied once the adapter arrives.
pub struct SoftwareMixer {
    state: Mutex<SoftwareMixerState>,
    events: Arc<ListenerRegistry<MixerEvent>>,
}

impl Default for SoftwareMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareMixer {
    pub const NAME: &'static str = "software";

    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftwareMixerState::default()),
            events: Arc::new(ListenerRegistry::new()),
        }
    }

    /// Registry adapters should notify on changes
    pub fn event_registry(&self) -> Arc<ListenerRegistry<MixerEvent>> {
        Arc::clone(&self.events)
    }

    pub fn setup(&self, adapter: Arc<SoftwareMixerAdapter>) {
        let (volume, mute) = {
            let mut state = lock(&self.state);
            state.adapter = Some(adapter);
            (state.initial_volume.take(), state.initial_mute.take())
        };

        if let Some(volume) = volume {
            self.set_volume(volume);
        }
        if let Some(mute) = mute {
            self.set_mute(mute);
        }
        debug!("Software mixer set up");
    }

    pub fn teardown(&self) {
        lock(&self.state).adapter = None;
        debug!("Software mixer torn down");
    }

    fn adapter(&self) -> Option<Arc<SoftwareMixerAdapter>> {
        lock(&self.state).adapter.clone()
    }
}

impl Mixer for SoftwareMixer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn get_volume(&self) -> Option<u8> {
        self.adapter().map(|a| a.get_volume())
    }

    fn set_volume(&self, volume: u8) -> bool {
        match self.adapter() {
            Some(adapter) => adapter.set_volume(volume),
            None => {
                lock(&self.state).initial_volume = Some(volume);
                false
            }
        }
    }

    fn get_mute(&self) -> Option<bool> {
        self.adapter().map(|a| a.get_mute())
    }

    fn set_mute(&self, mute: bool) -> bool {
        match self.adapter() {
            Some(adapter) => adapter.set_mute(mute),
            None => {
                lock(&self.state).initial_mute = Some(mute);
                false
            }
        }
    }

    fn events(&self) -> &ListenerRegistry<MixerEvent> {
        &self.events
    }

    fn as_software(&self) -> Option<&SoftwareMixer> {
        Some(self)
    }
}

/// Creates a mixer from the audio configuration
pub type MixerFactory = fn(&AudioConfig) -> Arc<dyn Mixer>;

static GLOBAL_REGISTRY: Lazy<MixerRegistry> = Lazy::new(MixerRegistry::default);

/// Name to mixer factory lookup
#[derive(Default)]
pub struct MixerRegistry {
    factories: Mutex<HashMap<String, MixerFactory>>,
}

impl MixerRegistry {
    pub fn global() -> &'static MixerRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register `factory` under `name`; an existing entry is kept
    ///
    /// Returns whether the factory was added.
    pub fn register(&self, name: &str, factory: MixerFactory) -> bool {
        let mut factories = lock(&self.factories);
        if factories.contains_key(name) {
            return false;
        }
        factories.insert(name.to_string(), factory);
        info!("Registered mixer \"{}\"", name);
        true
    }

    pub fn create(&self, name: &str, config: &AudioConfig) -> Option<Arc<dyn Mixer>> {
        let factory = lock(&self.factories).get(name).copied()?;
        Some(factory(config))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.factories).keys().cloned().collect();
        names.sort();
        names
    }
}

fn create_software_mixer(_config: &AudioConfig) -> Arc<dyn Mixer> {
    Arc::new(SoftwareMixer::new())
}

/// Register the built-in mixers in the global registry
///
/// Safe to call more than once.
pub fn register_builtin_mixers() {
    MixerRegistry::global().register(SoftwareMixer::NAME, create_software_mixer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::simulated::SimulatedEngine;
    use crate::pipeline::MediaEngine;

    fn adapter_for(mixer: &SoftwareMixer) -> Arc<SoftwareMixerAdapter> {
        let engine = SimulatedEngine::default();
        let volume = VolumeControl::new(engine.make_element("volume", None).unwrap());
        Arc::new(SoftwareMixerAdapter::new(volume, mixer.event_registry()))
    }

    #[test]
    fn test_unset_mixer_remembers_initial_values() {
        let mixer = SoftwareMixer::new();
        assert_eq!(mixer.get_volume(), None);
        assert!(!mixer.set_volume(30));
        assert!(!mixer.set_mute(true));

        mixer.setup(adapter_for(&mixer));
        assert_eq!(mixer.get_volume(), Some(30));
        assert_eq!(mixer.get_mute(), Some(true));
    }

    #[test]
    fn test_changes_are_broadcast() {
        let mixer = SoftwareMixer::new();
        mixer.setup(adapter_for(&mixer));
        let mut events = mixer.events().subscribe();

        assert!(mixer.set_volume(75));
        assert!(mixer.set_mute(true));

        assert_eq!(
            events.drain(),
            vec![
                MixerEvent::VolumeChanged { volume: 75 },
                MixerEvent::MuteChanged { mute: true },
            ]
        );
    }

    #[test]
    fn test_teardown_detaches_adapter() {
        let mixer = SoftwareMixer::new();
        mixer.setup(adapter_for(&mixer));
        mixer.teardown();
        assert_eq!(mixer.get_volume(), None);
    }

    #[test]
    fn test_registry_is_idempotent() {
        register_builtin_mixers();
        register_builtin_mixers();

        let registry = MixerRegistry::global();
        assert!(registry.names().contains(&"software".to_string()));

        let mixer = registry
            .create("software", &AudioConfig::default())
            .unwrap();
        assert_eq!(mixer.name(), "software");
        assert!(mixer.as_software().is_some());
        assert!(registry.create("alsamixer", &AudioConfig::default()).is_none());
    }
}
