use crate::CommentId;

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Comment not found {0}")]
    NotFound(CommentId),

    #[error("Persistence request failed: {0}")]
    Persistence(String),

    #[error("Change feed failure: {0}")]
    Subscription(String),
}

impl Error {
    /// Errors raised before anything was sent or mutated
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::NullByteInString(_))
    }

    /// Errors raised by the persistence collaborator
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_) | Error::PermissionDenied | Error::NotFound(_) | Error::Unknown(_)
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Error {
        Error::Unknown(format!("{err:#}"))
    }
}
