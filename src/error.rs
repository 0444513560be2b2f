//! Error types and handling for mvent

/// Result type alias for mvent operations
pub type Result<T> = std::result::Result<T, MventError>;

/// Error types surfaced by the shared pool and the channels built on it
#[derive(Debug, thiserror::Error)]
pub enum MventError {
    /// Backing file create/map/read/write failure
    #[error("backing I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// File lock not acquired within the configured budget
    #[error("file lock not acquired within {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    /// Encoded record does not fit in remaining capacity after compaction
    #[error("pool full: record needs {requested} bytes, {available} available")]
    Full { requested: usize, available: usize },

    /// Value could not be encoded
    #[error("encode error: {message}")]
    Encode { message: String },

    /// Stored bytes could not be decoded back into a value
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Authenticated decryption failed (wrong key or tampered record)
    #[error("decrypt error: {message}")]
    Decrypt { message: String },

    /// Awaited router response was not received in time
    #[error("call timed out after {waited_ms} ms: {path}")]
    CallTimeout { path: String, waited_ms: u64 },

    /// A route handler failed while producing a response
    #[error("handler error: {message}")]
    Handler { message: String },

    /// Operation on a component that has been cleaned up
    #[error("component is stopped")]
    Stopped,

    /// Invalid parameters or configuration
    #[error("invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Pool file failed structural validation (bad magic, version, or checksum)
    #[error("corrupt pool file: {message}")]
    Corrupt { message: String },
}

impl MventError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create an I/O error without an underlying source
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
            source: None,
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(waited_ms: u64) -> Self {
        Self::LockTimeout { waited_ms }
    }

    /// Create a pool-full error
    pub fn full(requested: usize, available: usize) -> Self {
        Self::Full {
            requested,
            available,
        }
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a decrypt error
    pub fn decrypt(message: impl Into<String>) -> Self {
        Self::Decrypt {
            message: message.into(),
        }
    }

    /// Create a call timeout error
    pub fn call_timeout(path: impl Into<String>, waited_ms: u64) -> Self {
        Self::CallTimeout {
            path: path.into(),
            waited_ms,
        }
    }

    /// Create a handler error
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt-file error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Whether the error is transient: background tasks log these and retry
    /// at their next tick instead of escalating through the error sink.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::LockTimeout { .. })
    }
}

// Convert from common error types
impl From<std::io::Error> for MventError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<bincode::Error> for MventError {
    fn from(err: bincode::Error) -> Self {
        Self::decode(format!("bincode error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = MventError::full(2048, 512);
        assert!(matches!(err, MventError::Full { .. }));

        let err = MventError::lock_timeout(250);
        assert!(matches!(err, MventError::LockTimeout { waited_ms: 250 }));

        let err = MventError::invalid_parameter("capacity", "too small");
        assert!(matches!(err, MventError::InvalidParameter { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = MventError::full(2048, 512);
        let display = format!("{}", err);
        assert!(display.contains("pool full"));
        assert!(display.contains("2048"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(MventError::io("mmap failed").is_transient());
        assert!(MventError::lock_timeout(10).is_transient());
        assert!(!MventError::Stopped.is_transient());
        assert!(!MventError::decode("bad frame").is_transient());
    }
}
