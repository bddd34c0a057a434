use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP Request error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Server error: status code {status_code}, message: {message}")]
    ServerError {
        status_code: u16,
        message: String,
    },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl BackendError {
    pub fn server_error(status_code: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status_code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, BackendError::Unauthorized(_))
    }

    /// Message shown on a failed entry
    pub fn user_message(&self) -> String {
        match self {
            BackendError::HttpError(err) if err.is_timeout() => {
                "The request timed out. Please try again.".to_string()
            }
            BackendError::HttpError(err) if err.is_connect() => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            BackendError::HttpError(err) => err.to_string(),
            BackendError::Unauthorized(_) => "Your session has expired. Please sign in again.".to_string(),
            BackendError::ServerError { message, .. } => message.clone(),
            BackendError::DecodeError(_) => "Unexpected response from the server.".to_string(),
            BackendError::InvalidRequest(message) => message.clone(),
            BackendError::InvalidUrl(err) => format!("Invalid server address: {}", err),
        }
    }
}

/// Error alias
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
