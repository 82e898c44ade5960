use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Schema mismatch for {metric}: {message}")]
    SchemaMismatch { metric: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Remote dispatch error: {0}")]
    Remote(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("No worker instance registered for role {role} (index {index})")]
    NoInstance { role: String, index: usize },

    #[error("Unknown metric type: {0}")]
    UnknownMetric(String),

    #[error("Invalid time bucket {bucket}: {reason}")]
    InvalidTimeBucket { bucket: i64, reason: String },

    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Async task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Timeout error: operation took longer than {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Creates a new schema mismatch error
    pub fn schema<M: Into<String>, S: Into<String>>(metric: M, msg: S) -> Self {
        Self::SchemaMismatch {
            metric: metric.into(),
            message: msg.into(),
        }
    }

    /// Creates a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new remote dispatch error
    pub fn remote<S: Into<String>>(msg: S) -> Self {
        Self::Remote(msg.into())
    }

    /// Creates a new network error
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Returns true if retrying the failed operation may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Storage(_) | Self::Remote(_) => true,
            Self::Timeout { .. } | Self::ChannelSend => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns the error category for structured logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::SchemaMismatch { .. } | Self::UnknownMetric(_) => "schema",
            Self::InvalidTimeBucket { .. } => "validation",
            Self::Storage(_) => "storage",
            Self::Config(_) => "config",
            Self::Remote(_) | Self::Network(_) => "network",
            Self::UnknownRole(_) | Self::NoInstance { .. } => "routing",
            Self::Decode(_) | Self::Encode(_) => "serialization",
            Self::Io(_) => "io",
            Self::Join(_) => "async",
            Self::ChannelSend => "channel",
            Self::Timeout { .. } => "timeout",
        }
    }
}
