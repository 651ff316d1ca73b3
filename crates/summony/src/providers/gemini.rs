use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Chunk, ChunkStream, Provider};
use super::configs::GeminiProviderConfig;
use super::utils::{body_lines, check_response, sse_data};
use crate::models::message::ChatMessage;
use crate::models::role::Role;
use crate::params::Params;

pub struct GeminiProvider {
    client: Client,
    config: GeminiProviderConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// Gemini calls the assistant `model`, takes the system prompt as an
    /// instruction and the options as `generationConfig`
    fn payload(messages: &[ChatMessage], options: &Params) -> Value {
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(&first.content), rest),
            _ => (None, messages),
        };

        let contents: Vec<Value> = rest
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut payload = json!({ "contents": contents });
        if let Some(system) = system {
            payload["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if !options.is_empty() {
            payload["generationConfig"] = Value::Object(options.clone());
        }
        payload
    }

    async fn post(&self, model: &str, action: &str, payload: &Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/v1beta/models/{}:{}",
            self.config.host.trim_end_matches('/'),
            model,
            action
        );

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(payload)
            .send()
            .await?;
        check_response(response).await
    }

    /// Concatenated text of the first candidate's parts
    fn candidate_text(raw: &Value) -> Option<String> {
        let parts = raw.pointer("/candidates/0/content/parts")?.as_array()?;
        let texts: Vec<&str> = parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.concat())
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)> {
        let payload = Self::payload(messages, options);
        let response: Value = self
            .post(model, "generateContent", &payload)
            .await?
            .json()
            .await?;

        let content = Self::candidate_text(&response)
            .ok_or_else(|| anyhow!("Invalid response format from Gemini API"))?;
        Ok((content, response))
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream> {
        let payload = Self::payload(messages, options);
        let response = self
            .post(model, "streamGenerateContent?alt=sse", &payload)
            .await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::try_stream! {
            let mut index = 0;
            while let Some(line) = lines.next().await {
                let line = line?;
                let data = match sse_data(&line) {
                    Some(data) => data,
                    None => continue,
                };
                let raw: Value = serde_json::from_str(data)?;
                if let Some(error) = raw.get("error") {
                    Err::<(), _>(anyhow!("Gemini error: {}", error))?;
                }
                match Self::candidate_text(&raw) {
                    Some(text) => {
                        yield Chunk::new(text, raw);
                    }
                    None => {
                        tracing::warn!(chunk = index, "Gemini chunk has no text");
                        yield Chunk::malformed(raw);
                    }
                }
                index += 1;
            }
        }))
    }

    fn base_url(&self) -> String {
        self.config.host.clone()
    }
}
