use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Chunk, ChunkStream, Provider};
use super::configs::OpenAiProviderConfig;
use super::utils::{apply_options, body_lines, check_response, messages_to_wire, sse_data};
use crate::models::message::ChatMessage;
use crate::models::role::Role;
use crate::params::Params;

pub struct OpenAiProvider {
    client: Client,
    config: OpenAiProviderConfig,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        )
    }

    /// o1 models accept neither system messages nor streaming
    fn is_o1(model: &str) -> bool {
        model.starts_with("o1")
    }

    fn payload(model: &str, messages: &[ChatMessage], options: &Params) -> Value {
        let mut wire_messages = messages_to_wire(messages);
        if Self::is_o1(model) && messages.first().map(|m| m.role) == Some(Role::System) {
            wire_messages[0]["role"] = json!("user");
        }

        let mut payload = json!({
            "model": model,
            "messages": wire_messages,
        });
        apply_options(&mut payload, options);
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(payload)
            .send()
            .await?;
        check_response(response).await
    }

    fn completion_text(response: &Value) -> Result<String> {
        if let Some(error) = response.get("error") {
            return Err(anyhow!("OpenAI API error: {}", error));
        }
        response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid response format from OpenAI API"))
    }

    fn parse_chunk(data: &str, index: usize) -> Result<Chunk> {
        let raw: Value = serde_json::from_str(data)?;
        match raw.pointer("/choices/0/delta") {
            Some(delta) => {
                let text = delta.get("content").and_then(Value::as_str).unwrap_or("");
                Ok(Chunk::new(text, raw.clone()))
            }
            None => {
                tracing::warn!(chunk = index, "OpenAI chunk has no delta content");
                Ok(Chunk::malformed(raw))
            }
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)> {
        let payload = Self::payload(model, messages, options);
        let response: Value = self.post(&payload).await?.json().await?;
        let text = Self::completion_text(&response)?;
        Ok((text, response))
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream> {
        if Self::is_o1(model) {
            let (text, raw) = self.complete(model, messages, options).await?;
            return Ok(futures::stream::once(async move { Ok(Chunk::new(text, raw)) }).boxed());
        }

        let mut payload = Self::payload(model, messages, options);
        payload["stream"] = json!(true);
        let response = self.post(&payload).await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::try_stream! {
            let mut index = 0;
            while let Some(line) = lines.next().await {
                let line = line?;
                match sse_data(&line) {
                    Some("[DONE]") => break,
                    Some(data) => {
                        yield Self::parse_chunk(data, index)?;
                        index += 1;
                    }
                    None => continue,
                }
            }
        }))
    }

    fn base_url(&self) -> String {
        format!("{}/v1/", self.config.host.trim_end_matches('/'))
    }
}
