use crate::parser::ParseErrorKind;
use std::io;

/// Central error type for the server core.
#[derive(Debug)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Error during HTTP request parsing.
    Parse(ParseErrorKind),
    /// Connection table reached its maximum capacity.
    ConnectionLimit,
    /// Generic or miscellaneous error.
    Other(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
            ServerError::Parse(e) => write!(f, "Parse error: {:?}", e),
            ServerError::ConnectionLimit => write!(f, "Connection table is full"),
            ServerError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::Io(e)
    }
}

impl From<ParseErrorKind> for ServerError {
    fn from(e: ParseErrorKind) -> Self {
        ServerError::Parse(e)
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
