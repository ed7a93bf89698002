//! Error taxonomy for the stack core, controller, task harness and trainer.
//!
//! One enum for the whole crate: shape and configuration violations are
//! fatal and carry enough context to name the broken invariant; data errors
//! surface grammar/dataset problems before they turn into empty batches.

/// All errors that can occur within stacknn.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A buffer handed to the stack or controller has the wrong length.
    #[error("shape mismatch for {what}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The pre-allocated stack arena is full.
    #[error("stack capacity exceeded: arena holds {max_steps} steps")]
    CapacityExceeded { max_steps: usize },

    /// Invalid hyperparameters, or parameters that do not fit the config.
    #[error("configuration error: {0}")]
    Config(String),

    /// Grammar, dataset or CSV problems.
    #[error("data error: {0}")]
    Data(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Error::Data(msg.into())
    }
}

/// Convenience Result type used throughout stacknn.
pub type Result<T> = std::result::Result<T, Error>;

/// Check a slice length, returning `ShapeMismatch` on disagreement.
#[inline]
pub(crate) fn check_len(what: &'static str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(Error::ShapeMismatch { what, expected, got });
    }
    Ok(())
}
