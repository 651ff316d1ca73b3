use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::message::ChatMessage;
use crate::params::Params;

/// One increment of a streamed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `None` when the raw chunk carried no readable text
    pub text: Option<String>,
    pub raw: Value,
}

impl Chunk {
    pub fn new<S: Into<String>>(text: S, raw: Value) -> Self {
        Self {
            text: Some(text.into()),
            raw,
        }
    }

    pub fn malformed(raw: Value) -> Self {
        Self { text: None, raw }
    }
}

pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// Base trait for AI providers (OpenAI, Anthropic, etc)
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate a full reply to `messages`, returning its text and the raw response
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)>;

    /// Generate a reply as a stream of text increments
    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream>;

    /// Where requests go; only used when logging calls
    fn base_url(&self) -> String;
}
