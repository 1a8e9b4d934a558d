use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The schedule definition is out of range or could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl CoreError {
    /// Short, stable error code for logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::InvalidSchedule(_) => "INVALID_SCHEDULE",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
