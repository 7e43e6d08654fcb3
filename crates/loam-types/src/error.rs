use thiserror::Error;

/// Errors from decoding identifier bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The input slice has the wrong length for the identifier.
    #[error("invalid id length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
