//! Global subscriber installation. Kept in its own test binary: the
//! subscriber is process-wide and would swallow events other tests capture.

use flim_oct_daq::logging::{self, LogFormat, LogSettings};

#[test]
fn test_second_init_is_noop() {
    assert!(logging::init(LogSettings::default()).is_ok());
    assert!(tracing::dispatcher::has_been_set());
    assert!(logging::init(LogSettings::default().with_format(LogFormat::Json)).is_ok());
    tracing::info!("Logging initialised");
}
