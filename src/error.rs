use thiserror::Error;

/// Classified failure of a query or mutation.
///
/// Errors are stored on cache entries and handed to every request joined to the same in-flight fetch, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The transport could not reach the server.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-2xx status.
    #[error("server responded with status {status}: {message}")]
    Server { status: u16, message: String },

    /// The response didn't match the expected shape, or a query argument could not be serialized into a key.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The cache has been closed.
    #[error("query cache is closed")]
    Closed,
}

impl Error {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// HTTP status of a server error.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
