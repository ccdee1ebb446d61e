//! Ambient utilities shared by the micro workspace binaries.

pub mod logging;

pub use logging::{LogFormat, LoggingError};
