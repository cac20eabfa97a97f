//! Language-model access: chat backends, provider failover and prompts.

pub mod chain;
pub mod openai;
pub mod prompt;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

pub use chain::ProviderChain;
pub use openai::OpenAiCompatibleBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Whether the provider is asked to enforce a JSON object response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Structured,
    FreeForm,
}

#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Provider label used in logs and failure reports
    fn name(&self) -> &str;

    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ChatMessage],
        mode: OutputMode,
    ) -> Result<String, LlmError>;
}

pub type SharedBackend = Arc<dyn LlmBackend>;
