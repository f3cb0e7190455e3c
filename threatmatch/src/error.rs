//! Error types for the matching client

use thiserror::Error;
use threatmatch_api::ApiError;
use threatmatch_db::DatabaseError;
use threatmatch_url::UrlError;

/// Result type alias for matching operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for matching operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Failure reported by the network collaborator
    #[error("Network error: {0}")]
    Network(#[from] threatmatch_api::Error),

    /// Database operation errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// URL parsing and validation errors
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Internal library errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<UrlError> for Error {
    fn from(err: UrlError) -> Self {
        match err {
            UrlError::InvalidFormat(msg) | UrlError::InvalidHost(msg) => Error::InvalidUrl(msg),
            UrlError::Idna(msg) => Error::InvalidUrl(format!("IDNA error: {msg}")),
            UrlError::TooManyEscapes => {
                Error::InvalidUrl("too many levels of percent-encoding".to_string())
            }
        }
    }
}

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    /// Add static context to an error
    fn context(self, msg: &'static str) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let base_error = e.into();
            Error::Internal(format!("{}: {}", f(), base_error))
        })
    }

    fn context(self, msg: &'static str) -> Result<T> {
        self.with_context(|| msg.to_string())
    }
}

fn api_error_is_retryable(error: &ApiError) -> bool {
    match error {
        // 5xx errors are generally retryable, 4xx are not (except 429)
        ApiError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
        ApiError::RateLimit { .. } | ApiError::ServerUnavailable(_) => true,
        ApiError::Authentication(_) | ApiError::BadRequest(_) | ApiError::QuotaExceeded => false,
    }
}

impl Error {
    /// Returns true if this error indicates a temporary condition that might succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(threatmatch_api::Error::Api(api_error)) => {
                api_error_is_retryable(api_error)
            }
            Error::Network(threatmatch_api::Error::Http(req_error)) => {
                req_error.is_timeout() || req_error.is_connect()
            }
            Error::Network(threatmatch_api::Error::Service(_)) => true,
            // The list is refetched on the next cycle
            Error::Database(DatabaseError::ChecksumMismatch { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if this is a permanent error that shouldn't be retried
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_)
                | Error::InvalidUrl(_)
                | Error::Network(threatmatch_api::Error::Configuration(_))
                | Error::Network(threatmatch_api::Error::Api(ApiError::Authentication(_)))
                | Error::Network(threatmatch_api::Error::Api(ApiError::BadRequest(_)))
                | Error::Database(DatabaseError::InvalidHashLength(_))
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration(_) => "Configuration issue detected".to_string(),
            Error::Network(threatmatch_api::Error::Api(ApiError::Authentication(_))) => {
                "Invalid API key or authentication failed".to_string()
            }
            Error::Network(threatmatch_api::Error::Api(ApiError::QuotaExceeded)) => {
                "API quota exceeded, please try again later".to_string()
            }
            Error::Network(threatmatch_api::Error::Api(ApiError::RateLimit { .. })) => {
                "Rate limited by API, please wait before retrying".to_string()
            }
            Error::Network(_) => "Threat service unreachable".to_string(),
            Error::InvalidUrl(url) => format!("Invalid URL format: {url}"),
            Error::Database(DatabaseError::StorageCorrupted(_)) => {
                "Database corruption detected, local lists were reset".to_string()
            }
            Error::Database(DatabaseError::ChecksumMismatch { .. }) => {
                "Threat list out of sync, it will be refetched".to_string()
            }
            _ => "An unexpected error occurred".to_string(),
        }
    }
}
