//! Shared utilities

pub mod logging;
pub mod retry;

pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use retry::RetryConfig;
