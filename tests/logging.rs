//! Global subscriber installation, kept in its own test binary

use rust_visa::config::LoggingSettings;
use rust_visa::logging;

#[test]
fn test_second_init_is_harmless() {
    let settings = LoggingSettings::default();
    assert!(logging::init(&settings));
    assert!(!logging::init(&settings));
    tracing::info!("still logging after a refused init");
}
