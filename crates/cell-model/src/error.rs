//! Errors raised by host-side state handling and snapshot I/O

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Error)]
pub enum ModelError {
    /// More cells were requested than the state was allocated for.
    #[error("cell count {requested} exceeds capacity {capacity}")]
    CapacityExceeded { requested: u64, capacity: u32 },

    /// Reading or writing a snapshot failed.
    #[error("I/O failure on {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A step file did not match the expected layout.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}

impl ModelError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::IoFailure {
            path: path.into(),
            source,
        }
    }
}
