//! Error types for pool operations

use std::io;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Memory operation errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The page provider could not satisfy a backing-page request
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Number of bytes the failed request asked for
        requested: usize,
    },

    /// An OS-level virtual-memory call failed
    #[error("system error: {0}")]
    System(#[from] io::Error),
}

impl MemoryError {
    /// Create an out of memory error
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let err = MemoryError::out_of_memory(4096);
        assert_eq!(err.to_string(), "out of memory: requested 4096 bytes");

        let err: MemoryError = io::Error::from_raw_os_error(12).into();
        assert!(err.to_string().starts_with("system error:"));
    }
}
