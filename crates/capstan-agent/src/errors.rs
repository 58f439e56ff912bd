//! Error surface of the task execution core.

use capstan_taskstore::{InvalidTransition, StateStoreError};

use crate::provider::ProviderError;

/// Errors surfaced by [`TaskLoop`](crate::runner::TaskLoop) and its
/// collaborators.
///
/// Cancellation and the iteration limit are not errors; they end the
/// run with an `Ok` result whose status is `failed`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] StateStoreError),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<InvalidTransition> for AgentError {
    fn from(err: InvalidTransition) -> Self {
        AgentError::InvalidState(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
