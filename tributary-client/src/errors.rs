use thiserror::Error;
use tributary_core::StoreError;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Link-level error conditions reported by the broker or the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    ServerBusy,
    Timeout,
    ConnectionForced,
    LinkDetachForced,
    InternalError,
    NotFound,
    Unauthorized,
    ResourceLimitExceeded,
}

impl ErrorCondition {
    /// Transient conditions are worth retrying with the same request.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCondition::ServerBusy
                | ErrorCondition::Timeout
                | ErrorCondition::ConnectionForced
                | ErrorCondition::LinkDetachForced
                | ErrorCondition::InternalError
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("link error ({condition:?}): {description}")]
    Link {
        condition: ErrorCondition,
        description: String,
    },

    #[error("{0} is already closed")]
    AlreadyClosed(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("ownership store error: {0}")]
    Store(String),

    #[error("event handler error: {0}")]
    Handler(String),

    #[error("unable to perform operation: {0}")]
    Unrecoverable(String),
}

impl ClientError {
    pub fn link(condition: ErrorCondition, description: impl Into<String>) -> Self {
        ClientError::Link {
            condition,
            description: description.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Link { condition, .. } => condition.is_transient(),
            _ => false,
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(error: StoreError) -> Self {
        ClientError::Store(error.to_string())
    }
}
