use thiserror::Error;

/// Errors surfaced by a coordinator implementation.
///
/// `Unavailable` is the transient class: workers retry after a backoff.
/// Everything else reflects a coordinator decision or a malformed exchange.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator unavailable: {0}")]
    Unavailable(String),

    #[error("coordinator rejected request: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CoordinatorError {
    /// Whether the caller should retry after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoordinatorError::Unavailable(_))
    }
}
