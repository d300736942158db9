use dot11n_core::Dot11nError;
use thiserror::Error;

/// Result type for MAC operations
pub type MacResult<T> = Result<T, MacError>;

/// Conditions that stop a MAC instance. Everything recoverable (full queues, retry-limit
/// drops, unsupported peers) is handled locally and surfaces only through statistics.
#[derive(Error, Debug)]
pub enum MacError {
    /// A composed frame exceeds the fragmentation threshold; fragmentation is not supported.
    #[error("frame of {size} bytes exceeds fragmentation threshold {threshold}")]
    FragmentationRequired { size: usize, threshold: usize },

    #[error("configuration error: {0}")]
    Config(#[from] Dot11nError),

    #[error("codec error: {0}")]
    Codec(String),
}

impl<E: std::fmt::Debug> From<nom::Err<E>> for MacError {
    fn from(err: nom::Err<E>) -> Self {
        MacError::Codec(format!("{err:?}"))
    }
}
