use std::fmt;

/// Main error type for the flock membership service
#[derive(Debug)]
pub enum FlockError {
    /// Configuration or CLI argument errors
    Config(String),

    /// Key material, sealing, or opening failures
    Crypto(String),

    /// Certificate parsing, chain, or identity errors
    Certificate(String),

    /// Transport layer errors
    Transport(String),

    /// Malformed or unexpected protocol messages
    Protocol(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Serialization/deserialization errors
    Serialization(SerializationError),

    /// Internal lock poisoning or concurrency errors
    Concurrency(String),
}

/// Serialization related errors
#[derive(Debug)]
pub enum SerializationError {
    /// JSON serialization/deserialization errors
    Json(serde_json::Error),

    /// Binary encoding errors
    BinaryEncode(bincode::error::EncodeError),

    /// Binary decoding errors
    BinaryDecode(bincode::error::DecodeError),
}

impl fmt::Display for FlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlockError::Config(msg) => write!(f, "Configuration error: {}", msg),
            FlockError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
            FlockError::Certificate(msg) => write!(f, "Certificate error: {}", msg),
            FlockError::Transport(msg) => write!(f, "Transport error: {}", msg),
            FlockError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            FlockError::Io(err) => write!(f, "I/O error: {}", err),
            FlockError::Serialization(err) => write!(f, "Serialization error: {}", err),
            FlockError::Concurrency(msg) => write!(f, "Concurrency error: {}", msg),
        }
    }
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializationError::Json(err) => write!(f, "JSON: {}", err),
            SerializationError::BinaryEncode(err) => write!(f, "Binary encode: {}", err),
            SerializationError::BinaryDecode(err) => write!(f, "Binary decode: {}", err),
        }
    }
}

impl std::error::Error for FlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlockError::Io(err) => Some(err),
            FlockError::Serialization(err) => err.source(),
            _ => None,
        }
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SerializationError::Json(err) => Some(err),
            SerializationError::BinaryEncode(err) => Some(err),
            SerializationError::BinaryDecode(err) => Some(err),
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, FlockError>;

impl FlockError {
    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            FlockError::Config(_) => "configuration_error",
            FlockError::Crypto(_) => "crypto_error",
            FlockError::Certificate(_) => "certificate_error",
            FlockError::Transport(_) => "transport_error",
            FlockError::Protocol(_) => "protocol_error",
            FlockError::Io(_) => "io_error",
            FlockError::Serialization(_) => "serialization_error",
            FlockError::Concurrency(_) => "concurrency_error",
        }
    }
}

// Conversions from common error types
impl From<std::io::Error> for FlockError {
    fn from(err: std::io::Error) -> Self {
        FlockError::Io(err)
    }
}

impl From<serde_json::Error> for FlockError {
    fn from(err: serde_json::Error) -> Self {
        FlockError::Serialization(SerializationError::Json(err))
    }
}

impl From<bincode::error::EncodeError> for FlockError {
    fn from(err: bincode::error::EncodeError) -> Self {
        FlockError::Serialization(SerializationError::BinaryEncode(err))
    }
}

impl From<bincode::error::DecodeError> for FlockError {
    fn from(err: bincode::error::DecodeError) -> Self {
        FlockError::Serialization(SerializationError::BinaryDecode(err))
    }
}

impl From<SerializationError> for FlockError {
    fn from(err: SerializationError) -> Self {
        FlockError::Serialization(err)
    }
}

impl From<aes_gcm::Error> for FlockError {
    fn from(_: aes_gcm::Error) -> Self {
        // aes-gcm deliberately carries no detail
        FlockError::Crypto("authenticated decryption failed".to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for FlockError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        FlockError::Crypto(format!("signature: {}", err))
    }
}

impl From<hex::FromHexError> for FlockError {
    fn from(err: hex::FromHexError) -> Self {
        FlockError::Config(format!("invalid hex: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::FlockError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! crypto_error {
    ($msg:expr) => {
        $crate::error::FlockError::Crypto($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Crypto(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! certificate_error {
    ($msg:expr) => {
        $crate::error::FlockError::Certificate($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Certificate(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::FlockError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::error::FlockError::Protocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Protocol(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::FlockError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::FlockError::Concurrency(format!($fmt, $($arg)*))
    };
}
