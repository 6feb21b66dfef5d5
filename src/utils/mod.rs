//! The `utils` module holds what the whole process shares: the top-level
//! error type and logging initialization.

pub mod error;
pub mod logging;

pub use error::Error;
