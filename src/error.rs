use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawnError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Terminal not found for ID: {0}")]
    TerminalNotFound(String),

    #[error("Edit error: {0}")]
    EditError(String),

    #[error("Rollback error: {0}")]
    RollbackError(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Reqwest HTTP error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("Model endpoint returned {status}: {message}")]
    TransportError { status: u16, message: String },

    #[error("Authentication failed (401): check AGENT_API_KEY")]
    Unauthorized,

    #[error("Cancelled by user")]
    Cancelled,

    #[error("Operation timed out: {0}")]
    TimeoutError(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl AppError {
    /// Errors the user has to see directly, as opposed to ones fed back to the model.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::TransportError { .. } | AppError::Unauthorized | AppError::ReqwestError(_)
        )
    }
}
