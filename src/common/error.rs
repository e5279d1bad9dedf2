use thiserror::Error;

use super::types::PageId;

/// Storage engine error types
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Buffer pool is full, no evictable frames available")]
    BufferPoolFull,

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Page {0} is still pinned")]
    PageStillPinned(PageId),

    #[error("Disk is full, no extent can hold another page")]
    DiskFull,

    #[error("Corrupt on-disk format: {0}")]
    CorruptFormat(String),

    #[error("Duplicate key")]
    DuplicateKey,

    #[error("Key size mismatch: expected {expected} bytes, got {actual}")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("Invalid {kind} node size {size} (allowed {min}..={max})")]
    InvalidNodeSize {
        kind: &'static str,
        size: usize,
        min: usize,
        max: usize,
    },

    #[error("Index roots page is full")]
    IndexRootsFull,

    #[error("Index corrupted: {0}")]
    IndexCorrupted(String),
}

impl StrataError {
    /// Returns true for conditions the caller cannot recover from by retrying
    /// or reporting to the user: an exhausted pool or disk, or on-disk state
    /// that no longer matches the expected layout.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::BufferPoolFull
                | StrataError::DiskFull
                | StrataError::CorruptFormat(_)
                | StrataError::IndexCorrupted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrataError::PageStillPinned(PageId::new(7));
        assert_eq!(err.to_string(), "Page PageId(7) is still pinned");

        let err = StrataError::KeySizeMismatch {
            expected: 4,
            actual: 8,
        };
        assert_eq!(
            err.to_string(),
            "Key size mismatch: expected 4 bytes, got 8"
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(StrataError::BufferPoolFull.is_fatal());
        assert!(StrataError::CorruptFormat("bad magic".into()).is_fatal());
        assert!(!StrataError::DuplicateKey.is_fatal());
        assert!(!StrataError::PageStillPinned(PageId::new(1)).is_fatal());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(!err.is_fatal());
    }
}
