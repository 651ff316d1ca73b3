use serde::{Deserialize, Serialize};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum AgentError {
    #[error("Prefill requires a fresh prompt")]
    PrefillWithoutPrompt,

    #[error("Nothing to re-ask: {0}")]
    NothingToReask(String),

    #[error("Agent {0} is not active")]
    InactiveAgent(usize),

    #[error("Unknown agent index: {0}")]
    UnknownAgent(usize),

    #[error("Invalid alternate: {0}")]
    InvalidAlternate(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Unknown agent kind: {0}")]
    UnknownAgentKind(String),

    #[error("Message {0} is missing from the snapshot")]
    MissingMessage(String),

    #[error("No parameter versions stored for agent {0}")]
    MissingParams(usize),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Usage errors are raised before any generation call and never touch a timeline.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            AgentError::PrefillWithoutPrompt
                | AgentError::NothingToReask(_)
                | AgentError::InactiveAgent(_)
                | AgentError::UnknownAgent(_)
                | AgentError::InvalidAlternate(_)
        )
    }

    pub fn generation(err: &anyhow::Error) -> Self {
        AgentError::Generation(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::MalformedSnapshot(err.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
