//! Registry error types

use super::key::StreamKey;

/// Error type for registry and source operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    /// A different live source already holds the key
    #[error("media source already registered: {0}")]
    AlreadyRegistered(StreamKey),
    /// The source has no delegate to carry out the operation
    #[error("no event delegate bound to {0}")]
    Unbound(StreamKey),
    /// The source's delegate does not implement the operation
    #[error("operation not supported by {0}")]
    Unsupported(StreamKey),
    /// A stream URL could not be parsed
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
}
