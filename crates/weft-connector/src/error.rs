use weft_types::FailureCode;

/// Errors surfaced by the connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// A submitted operation drained with a recorded failure.
    #[error("operation failed in task \"{task}\": {code}")]
    OperationFailed { code: FailureCode, task: String },

    /// The progress pump gave up before the operation finished.
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] weft_store::StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] weft_engine::EngineError),

    #[error("messaging error: {0}")]
    Comm(#[from] weft_comm::CommError),

    #[error("type error: {0}")]
    Type(#[from] weft_types::TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ConnectorError {
    /// The failure code a request should record for this error.
    pub fn failure_code(&self) -> FailureCode {
        match self {
            ConnectorError::OperationFailed { code, .. } => *code,
            ConnectorError::Store(err) => FailureCode::Store(err.code()),
            ConnectorError::Engine(_) => FailureCode::Engine,
            ConnectorError::Comm(weft_comm::CommError::LengthMismatch { .. }) => {
                FailureCode::Truncated
            }
            ConnectorError::Comm(_) => FailureCode::Messaging,
            ConnectorError::Timeout(_) => FailureCode::Canceled,
            _ => FailureCode::BadValue,
        }
    }
}

/// Result alias for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
