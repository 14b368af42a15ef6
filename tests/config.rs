use std::{io::Write, time::Duration};
use tower_probe_breaker::{
    config::{load_settings, ConfigError, ValidationError},
    ErrorKind, InMemorySink, InstrumentedExecutor, ManualClock,
};

fn write_settings(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_breaker_settings_from_disk() {
    let file = write_settings(
        r#"
        log_level = "tower_probe_breaker=debug"

        [breaker]
        failure_threshold = 2
        recovery_timeout_ms = 250
        counted_failure_kinds = ["timeout"]

        [metrics]
        namespace = "feature_store"
        "#,
    );

    let settings = load_settings(file.path()).unwrap();
    assert_eq!(settings.log_level.as_str(), "tower_probe_breaker=debug");
    assert_eq!(settings.breaker.failure_threshold, 2);
    assert_eq!(settings.breaker.recovery_timeout, Duration::from_millis(250));
    assert_eq!(settings.breaker.window_size, 10);
    assert!(settings.breaker.counts(ErrorKind::Timeout));
    assert!(!settings.breaker.counts(ErrorKind::BadStatus));
    assert!(settings.metrics.enabled);
    assert_eq!(settings.metrics.namespace.as_deref(), Some("feature_store"));

    let executor = InstrumentedExecutor::from_parts(
        settings.breaker,
        ManualClock::new(),
        InMemorySink::new(),
    );
    assert!(executor.is_ok());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_settings(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)), "{err}");
}

#[test]
fn malformed_file_is_a_parse_error() {
    let file = write_settings("[breaker\nfailure_threshold = ");
    let err = load_settings(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "{err}");
}

#[test]
fn out_of_range_values_are_rejected() {
    let file = write_settings("[breaker]\nwindow_size = 0\n");
    match load_settings(file.path()).unwrap_err() {
        ConfigError::Validation(errors) => {
            assert_eq!(errors, vec![ValidationError::ZeroWindowSize])
        }
        other => panic!("expected a validation error, got {other}"),
    }
}
