//! Observability.

pub mod logging;

pub use logging::{init_tracing, LogConfig, LogFormat, LogLevel};
