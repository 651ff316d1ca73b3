use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::base::{Chunk, ChunkStream, Provider};
use crate::models::message::ChatMessage;
use crate::params::Params;

/// What the mock does on its next call
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// Streamed as given; `None` stands for a chunk without readable text
    Chunks(Vec<Option<String>>),
    Fail(String),
    /// Streams `partial` then errors; `complete` fails outright
    FailMidStream { partial: Vec<String>, error: String },
}

impl MockReply {
    pub fn text<S: Into<String>>(text: S) -> Self {
        MockReply::Text(text.into())
    }

    pub fn fail<S: Into<String>>(error: S) -> Self {
        MockReply::Fail(error.into())
    }
}

/// A request the mock received
#[derive(Debug, Clone, PartialEq)]
pub struct MockRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: Params,
}

/// A mock provider that replays pre-configured replies for testing
#[derive(Clone, Default)]
pub struct MockProvider {
    replies: Arc<Mutex<VecDeque<MockReply>>>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of replies
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| MockReply::text(*t)).collect())
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self, model: &str, messages: &[ChatMessage], options: &Params) -> MockReply {
        self.requests.lock().unwrap().push(MockRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            options: options.clone(),
        });
        // Return empty reply if no more pre-configured replies
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockReply::text(""))
    }

    fn pieces(text: &str) -> Vec<Option<String>> {
        text.split_inclusive(' ').map(|p| Some(p.to_string())).collect()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)> {
        match self.next_reply(model, messages, options) {
            MockReply::Text(text) => {
                let raw = json!({"mock": true, "text": text});
                Ok((text, raw))
            }
            MockReply::Chunks(chunks) => {
                let text: String = chunks.into_iter().flatten().collect();
                let raw = json!({"mock": true, "text": text});
                Ok((text, raw))
            }
            MockReply::Fail(error) | MockReply::FailMidStream { error, .. } => {
                Err(anyhow!(error))
            }
        }
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream> {
        let (pieces, error) = match self.next_reply(model, messages, options) {
            MockReply::Text(text) => (Self::pieces(&text), None),
            MockReply::Chunks(chunks) => (chunks, None),
            MockReply::Fail(error) => return Err(anyhow!(error)),
            MockReply::FailMidStream { partial, error } => {
                (partial.into_iter().map(Some).collect(), Some(error))
            }
        };

        Ok(Box::pin(async_stream::try_stream! {
            for (index, piece) in pieces.into_iter().enumerate() {
                tokio::task::yield_now().await;
                let raw = json!({"mock": true, "index": index});
                match piece {
                    Some(text) => {
                        yield Chunk::new(text, raw);
                    }
                    None => {
                        yield Chunk::malformed(raw);
                    }
                }
            }
            if let Some(error) = error {
                Err::<(), _>(anyhow!(error))?;
            }
        }))
    }

    fn base_url(&self) -> String {
        "mock://".to_string()
    }
}
