//! Error types for quota configuration

/// Errors from building quota limits.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid limit: {0} must be greater than 0")]
    InvalidLimit(&'static str),
}

/// Result alias for quota operations.
pub type Result<T> = std::result::Result<T, Error>;
