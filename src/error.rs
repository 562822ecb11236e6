//! Error types and handling for shmkit

/// Result type alias for shmkit operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// Error types for segments, the buddy allocator and the containers built on it
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// The allocator has no block large enough for the request
    #[error("Allocator exhausted: requested {requested} bytes, {available} bytes free")]
    Exhausted { requested: u64, available: u64 },

    /// Segment header carries an unexpected magic number
    #[error("Magic mismatch: expected {expected:#010x}, found {actual:#010x}")]
    MagicMismatch { expected: u32, actual: u32 },

    /// Segment or allocator bookkeeping is inconsistent
    #[error("Corruption detected: {message}")]
    Corruption { message: String },

    /// An offset points outside the storage area
    #[error("Offset {offset:#x} (+{size} bytes) is outside the storage area of {limit} bytes")]
    OutOfBounds { offset: u64, size: u64, limit: u64 },

    /// A null or reserved offset was dereferenced
    #[error("Null offset pointer dereferenced")]
    NullPointer,

    /// Free of an offset that is not a live allocation of that size
    #[error("Invalid free at offset {offset:#x}: {message}")]
    InvalidFree { offset: u64, message: String },

    /// Alignment requirements cannot be met by the storage area
    #[error("Alignment error: offset {offset:#x} not aligned to {alignment}")]
    Alignment { offset: u64, alignment: usize },

    /// Container index out of range
    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: u64, len: u64 },

    /// Access to the front or back of an empty container
    #[error("Container empty: {container}")]
    Empty { container: &'static str },

    /// Segment already exists
    #[error("Segment already exists: {identifier}")]
    SegmentExists { identifier: String },

    /// Segment not found or doesn't exist
    #[error("Segment not found: {identifier}")]
    SegmentNotFound { identifier: String },

    /// Stored bytes are not valid UTF-8
    #[error("Invalid UTF-8 in shared string: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Snapshot encoding or decoding failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl ShmError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create an exhaustion error
    pub fn exhausted(requested: u64, available: u64) -> Self {
        Self::Exhausted {
            requested,
            available,
        }
    }

    /// Create a corruption error
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Create an invalid free error
    pub fn invalid_free(offset: u64, message: impl Into<String>) -> Self {
        Self::InvalidFree {
            offset,
            message: message.into(),
        }
    }

    /// Create an out of bounds error
    pub fn out_of_bounds(offset: u64, size: u64, limit: u64) -> Self {
        Self::OutOfBounds {
            offset,
            size,
            limit,
        }
    }

    /// Create an index error
    pub fn index_out_of_bounds(index: u64, len: u64) -> Self {
        Self::IndexOutOfBounds { index, len }
    }

    /// Create an empty container error
    pub fn empty(container: &'static str) -> Self {
        Self::Empty { container }
    }

    /// Create a segment exists error
    pub fn segment_exists(identifier: impl Into<String>) -> Self {
        Self::SegmentExists {
            identifier: identifier.into(),
        }
    }

    /// Create a segment not found error
    pub fn segment_not_found(identifier: impl Into<String>) -> Self {
        Self::SegmentNotFound {
            identifier: identifier.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// True for errors that indicate damaged segment contents
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::MagicMismatch { .. } | Self::Corruption { .. } | Self::OutOfBounds { .. }
        )
    }
}

// Convert from common error types
impl From<std::io::Error> for ShmError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for ShmError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization(format!("Bincode error: {}", err))
    }
}

impl From<nix::Error> for ShmError {
    fn from(err: nix::Error) -> Self {
        Self::platform(format!("System call failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = ShmError::exhausted(1024, 512);
        assert!(matches!(err, ShmError::Exhausted { .. }));

        let err = ShmError::segment_not_found("test_segment");
        assert!(matches!(err, ShmError::SegmentNotFound { .. }));

        let err = ShmError::invalid_free(0x40, "double free");
        assert!(matches!(err, ShmError::InvalidFree { offset: 0x40, .. }));
    }

    #[test]
    fn test_error_display() {
        let err = ShmError::corruption("index header damaged");
        let display = format!("{}", err);
        assert!(display.contains("Corruption detected"));
        assert!(display.contains("index header damaged"));

        let err = ShmError::MagicMismatch {
            expected: 0x534D_4B54,
            actual: 0,
        };
        assert!(format!("{}", err).contains("0x534d4b54"));
    }

    #[test]
    fn test_corruption_classification() {
        assert!(ShmError::corruption("x").is_corruption());
        assert!(ShmError::out_of_bounds(1, 2, 3).is_corruption());
        assert!(!ShmError::NullPointer.is_corruption());
        assert!(!ShmError::exhausted(1, 0).is_corruption());
    }
}
