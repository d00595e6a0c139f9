pub mod logging;
pub mod metrics;

pub use logging::{default_log_file, init_logging};
