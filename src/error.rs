use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Database(anyhow::Error),
    /// The wall clock moved backwards; the allocator refuses to emit ids
    /// until the clock catches up by `behind_ms`.
    ClockRegression { behind_ms: i64 },
    Configuration(String),
    NoResponsibleNodes(String),
    QuorumNotReached { required: usize, achieved: usize },
    NotFound(String),
    Transport(String),
    InvalidArgument(String),
    SerializationError(String),
    DeserializationError(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(err) => write!(f, "Database error: {}", err),
            AppError::ClockRegression { behind_ms } => write!(
                f,
                "Clock moved backwards. Refusing to generate ids for {} milliseconds",
                behind_ms
            ),
            AppError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            AppError::NoResponsibleNodes(key) => {
                write!(f, "No responsible nodes found for key '{}'", key)
            }
            AppError::QuorumNotReached { required, achieved } => write!(
                f,
                "Quorum not reached: {} of {} required replicas responded",
                achieved, required
            ),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            AppError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            AppError::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Database(err)
    }
}

pub type AppResult<T> = Result<T, AppError>;
