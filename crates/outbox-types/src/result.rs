//! Result type alias for outbox operations

use crate::Error;

/// Result type alias for outbox operations
pub type Result<T> = std::result::Result<T, Error>;
