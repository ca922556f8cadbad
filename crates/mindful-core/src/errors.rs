use thiserror::Error;

/// Message shown to the user when the backend refuses or fails to issue a token.
pub const TOKEN_FAILURE_MESSAGE: &str = "Failed to get LiveKit token";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0}")]
    Acquisition(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("capture device unavailable: {0}")]
    Resource(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(String),
}

/// Coarse classification carried in snapshots so UIs can branch without
/// matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    Acquisition,
    Connection,
    Resource,
    InvalidState,
    Auth,
    Http,
}

impl CallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Acquisition(_) => ErrorKind::Acquisition,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Resource(_) => ErrorKind::Resource,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Http(_) => ErrorKind::Http,
        }
    }

    /// The generic token failure every acquisition error collapses to.
    pub fn token_failure() -> Self {
        Self::Acquisition(TOKEN_FAILURE_MESSAGE.to_string())
    }
}
