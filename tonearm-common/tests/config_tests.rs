//! Configuration loading and graceful degradation

use std::io::Write;
use tempfile::{NamedTempFile, TempDir};
use tonearm_common::config::{
    AudioConfig, LoggingConfig, MixerKind, TomlConfig, MAX_BUFFER_TIME_MS,
};
use tonearm_common::Error;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_defaults() {
    let config = TomlConfig::default();
    assert_eq!(config.audio.output, "autoaudiosink");
    assert_eq!(config.audio.mixer_kind(), MixerKind::Software);
    assert!(config.audio.buffer_time.is_none());
    assert_eq!(config.logging.level, "info");
    assert!(config.logging.file.is_none());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("does-not-exist.toml");

    let config = TomlConfig::load_or_default(&path).unwrap();
    assert_eq!(config, TomlConfig::default());
}

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
        [audio]
        output = "testoutput"
        extra_outputs = ["filesink location=/tmp/out.mp3"]
        mixer = "software"
        mixer_volume = 40
        buffer_time = 2000
        visualizer = "goom"

        [logging]
        level = "debug"
        "#,
    );

    let config = TomlConfig::load(file.path()).unwrap();
    assert!(config.audio.uses_test_output());
    assert_eq!(config.audio.mixer_volume, Some(40));
    assert_eq!(config.audio.buffer_time, Some(2000));
    assert_eq!(config.audio.visualizer.as_deref(), Some("goom"));
    assert_eq!(config.logging.level, "debug");

    let outputs: Vec<&str> = config.audio.outputs().collect();
    assert_eq!(outputs, vec!["testoutput", "filesink location=/tmp/out.mp3"]);
}

#[test]
fn test_partial_section_keeps_other_defaults() {
    let file = write_config(
        r#"
        [audio]
        mixer = "none"
        "#,
    );

    let config = TomlConfig::load(file.path()).unwrap();
    assert_eq!(config.audio.mixer_kind(), MixerKind::Disabled);
    assert_eq!(config.audio.output, "autoaudiosink");
    assert_eq!(config.logging, LoggingConfig::default());
}

#[test]
fn test_named_mixer() {
    let audio = AudioConfig {
        mixer: "alsamixer".to_string(),
        ..AudioConfig::default()
    };
    assert_eq!(audio.mixer_kind(), MixerKind::Named("alsamixer".to_string()));
}

#[test]
fn test_out_of_range_volume_rejected() {
    let file = write_config(
        r#"
        [audio]
        mixer_volume = 150
        "#,
    );

    match TomlConfig::load(file.path()) {
        Err(Error::Config(msg)) => assert!(msg.contains("mixer_volume")),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_oversized_buffer_time_rejected() {
    let file = write_config(
        r#"
        [audio]
        buffer_time = 18446744073709551
        "#,
    );

    match TomlConfig::load(file.path()) {
        Err(Error::Config(msg)) => assert!(msg.contains("buffer_time")),
        other => panic!("expected config error, got {:?}", other),
    }

    let hour = AudioConfig {
        buffer_time: Some(MAX_BUFFER_TIME_MS),
        ..AudioConfig::default()
    };
    assert!(hour.validate().is_ok());
}

#[test]
fn test_malformed_toml_is_an_error() {
    let file = write_config("[audio\noutput = ");
    assert!(matches!(TomlConfig::load(file.path()), Err(Error::Toml(_))));
}

#[test]
fn test_roundtrip() {
    let config = TomlConfig {
        audio: AudioConfig {
            buffer_time: Some(500),
            ..AudioConfig::default()
        },
        logging: LoggingConfig::default(),
    };

    let text = toml::to_string(&config).unwrap();
    let parsed: TomlConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed, config);
}
