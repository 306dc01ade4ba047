use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    Config(String),
    Io(std::io::Error),
    Store(String),
    Blocked(String),
    InvalidToken(String),
    RateLimitedUser(String),
    RateLimitedIp(String),
    InvalidInput(String),
    NotFound(String),
    Internal(String),
}

impl Error {
    /// HTTP status the error surfaces as. The gate never retries on its own;
    /// retry policy belongs to the caller.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Blocked(_) | Error::InvalidToken(_) => StatusCode::FORBIDDEN,
            Error::RateLimitedUser(_) | Error::RateLimitedIp(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Store(msg) => write!(f, "Store error: {}", msg),
            Error::Blocked(msg) => write!(f, "Blocked: {}", msg),
            Error::InvalidToken(msg) => write!(f, "Invalid token: {}", msg),
            Error::RateLimitedUser(msg) => write!(f, "Rate limited (user): {}", msg),
            Error::RateLimitedIp(msg) => write!(f, "Rate limited (ip): {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Store(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
