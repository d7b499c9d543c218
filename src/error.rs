use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DistError {
    /// Write on a multi-shard table that has no sharding key
    #[error("Method write is not supported by storage {0} with more than one shard and no sharding key provided")]
    WriteNotSupported(String),

    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("Resharding background worker is not running")]
    NoReshardingWorker,

    #[error("Invalid coordination request: {0}")]
    InvalidCoordinationRequest(String),

    /// Statement rewriting received a statement of the wrong shape.
    /// Correct callers never trigger this.
    #[error("Malformed statement: {0}")]
    MalformedStatement(String),

    #[error("Shard {shard} failed: {message}")]
    ShardExecution { shard: usize, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Coordination error: {0}")]
    CoordinationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Column '{0}' not found")]
    ColumnNotFound(String),

    #[error("Column '{0}' already exists")]
    ColumnAlreadyExists(String),

    // Clone is required to hand one shard failure to several parties,
    // so foreign errors are flattened to their message.
    #[error("IO error: {0}")]
    IoError(String),

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type DistResult<T> = Result<T, DistError>;

impl DistError {
    /// Permanent errors are reported as is and never retried.
    /// Everything else is a shard-level failure that may succeed later.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DistError::WriteNotSupported(_)
                | DistError::UnsupportedOperation(_)
                | DistError::NoReshardingWorker
                | DistError::InvalidCoordinationRequest(_)
                | DistError::MalformedStatement(_)
                | DistError::ConfigError(_)
                | DistError::ColumnNotFound(_)
                | DistError::ColumnAlreadyExists(_)
        )
    }

    /// Attach a shard index to a failure coming out of a shard stream
    pub fn for_shard(self, shard: usize) -> DistError {
        match self {
            DistError::ShardExecution { .. } => self,
            other => DistError::ShardExecution {
                shard,
                message: other.to_string(),
            },
        }
    }
}

impl serde::Serialize for DistError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl From<std::io::Error> for DistError {
    fn from(err: std::io::Error) -> Self {
        DistError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for DistError {
    fn from(err: serde_json::Error) -> Self {
        DistError::JsonError(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for DistError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DistError::EncodeError(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for DistError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DistError::DecodeError(err.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for DistError {
    fn from(err: lz4_flex::block::DecompressError) -> Self {
        DistError::DecodeError(err.to_string())
    }
}

impl From<reqwest::Error> for DistError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DistError::Timeout(err.to_string())
        } else {
            DistError::NetworkError(err.to_string())
        }
    }
}

impl From<disttable_ast::AstError> for DistError {
    fn from(err: disttable_ast::AstError) -> Self {
        DistError::MalformedStatement(err.to_string())
    }
}
