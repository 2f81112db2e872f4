//! Error taxonomy for the chat pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Errors surfaced by the conversation store, the completion client and the
/// chat engine.
///
/// `Validation` and `Storage` fail the current operation. `Service` and
/// `Synthesis` are recovered inside the engine and reported as advisories.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ChatError {
    /// Malformed turn text (empty or over the length bound)
    #[error("invalid turn: {0}")]
    Validation(String),

    /// Durable read/write failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Completion call failed, timed out, or returned an unusable body
    #[error("completion service error: {0}")]
    Service(String),

    /// Completion failure while building the personality profile
    #[error("personality synthesis failed: {0}")]
    Synthesis(String),
}

impl ChatError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }

    pub fn synthesis(message: impl Into<String>) -> Self {
        Self::Synthesis(message.into())
    }

    /// Same string as the serde `kind` tag; attached to error log records.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "validation",
            ChatError::Storage(_) => "storage",
            ChatError::Service(_) => "service",
            ChatError::Synthesis(_) => "synthesis",
        }
    }

    /// Whether the engine degrades past this error instead of failing the call.
    pub fn is_advisory(&self) -> bool {
        matches!(self, ChatError::Service(_) | ChatError::Synthesis(_))
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Storage(format!("serialization: {}", err))
    }
}
