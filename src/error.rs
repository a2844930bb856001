use thiserror::Error;

/// Failure taxonomy for the credit and generation workflow.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("image service timed out after {0} seconds")]
    ServiceTimeout(u64),

    #[error("image service error: {message}")]
    ServiceError { message: String, retryable: bool },

    #[error("payment gateway reported '{gateway}' for session {session_id} in local state '{local}'")]
    PaymentMismatch {
        session_id: String,
        local: String,
        gateway: String,
    },

    #[error("duplicate payment confirmation for session {0}")]
    DuplicateConfirmation(String),

    #[error("unknown user {0}")]
    UnknownUser(i64),

    #[error("batch {0} already claimed")]
    BatchAlreadyClaimed(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    /// Whether a retry against the image service may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BotError::ServiceTimeout(_) => true,
            BotError::ServiceError { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

pub type BotResult<T> = Result<T, BotError>;
