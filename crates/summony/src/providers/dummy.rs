use anyhow::Result;
use async_trait::async_trait;
use indoc::indoc;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Chunk, ChunkStream, Provider};
use super::configs::DummyProviderConfig;
use crate::models::message::ChatMessage;
use crate::params::Params;

const CANNED_REPLIES: &[&str] = &[
    indoc! {"
        Sure! Here is a short overview:

        - **Point one** covers the basics.
        - **Point two** goes a little deeper.

        Let me know if you want more detail on either."},
    indoc! {"
        That's a good question. The short answer is *it depends*, but the simplest approach usually works best:

        ```python
        print(\"hello, world\")
        ```"},
    "I'm a dummy model, so I can only pretend to think about that. Still, it sounds interesting!",
    indoc! {"
        ## Summary

        1. Read the question.
        2. Reply with something plausible.
        3. Repeat."},
];

const WORDS_PER_CHUNK: usize = 3;

/// Offline provider replying with canned markdown, handy for demos and UI work
pub struct DummyProvider {
    config: DummyProviderConfig,
}

impl DummyProvider {
    pub fn new(config: DummyProviderConfig) -> Self {
        Self { config }
    }

    fn pick_reply() -> &'static str {
        CANNED_REPLIES
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or_default()
    }

    fn random_delay(&self) -> Duration {
        if self.config.max_delay.is_zero() {
            return Duration::ZERO;
        }
        rand::thread_rng().gen_range(Duration::ZERO..=self.config.max_delay)
    }

    fn raw_completion(model: &str, text: &str) -> Value {
        json!({
            "object": "chat.completion",
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": text}}]
        })
    }

    fn raw_chunk(model: &str, text: &str) -> Value {
        json!({
            "object": "chat.completion.chunk",
            "model": model,
            "choices": [{"index": 0, "delta": {"content": text}}]
        })
    }

    /// Split text into pieces of a few words each, keeping whitespace so they concatenate back
    fn word_groups(text: &str) -> Vec<String> {
        let mut groups = Vec::new();
        let mut current = String::new();
        let mut words = 0;
        for piece in text.split_inclusive(char::is_whitespace) {
            current.push_str(piece);
            if !piece.trim().is_empty() {
                words += 1;
            }
            if words == WORDS_PER_CHUNK {
                groups.push(std::mem::take(&mut current));
                words = 0;
            }
        }
        if !current.is_empty() {
            groups.push(current);
        }
        groups
    }
}

#[async_trait]
impl Provider for DummyProvider {
    async fn complete(
        &self,
        model: &str,
        _messages: &[ChatMessage],
        _options: &Params,
    ) -> Result<(String, Value)> {
        let text = Self::pick_reply();
        tokio::time::sleep(self.random_delay()).await;
        Ok((text.to_string(), Self::raw_completion(model, text)))
    }

    async fn stream(
        &self,
        model: &str,
        _messages: &[ChatMessage],
        _options: &Params,
    ) -> Result<ChunkStream> {
        let groups = Self::word_groups(Self::pick_reply());
        let delays: Vec<Duration> = groups.iter().map(|_| self.random_delay()).collect();
        let model = model.to_string();

        Ok(Box::pin(async_stream::try_stream! {
            for (group, delay) in groups.into_iter().zip(delays) {
                tokio::time::sleep(delay).await;
                let raw = Self::raw_chunk(&model, &group);
                yield Chunk::new(group, raw);
            }
        }))
    }

    fn base_url(&self) -> String {
        "dummy://local".to_string()
    }
}
