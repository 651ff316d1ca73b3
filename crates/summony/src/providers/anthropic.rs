use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Chunk, ChunkStream, Provider};
use super::configs::AnthropicProviderConfig;
use super::utils::{apply_options, body_lines, check_response, messages_to_wire, sse_data};
use crate::models::message::ChatMessage;
use crate::models::role::Role;
use crate::params::Params;

const DEFAULT_MAX_TOKENS: u32 = 4096;
const CURRENT_SONNET_MODEL: &str = "claude-3-5-sonnet-20240620";
const CURRENT_OPUS_MODEL: &str = "claude-3-opus-20240229";
const CURRENT_HAIKU_MODEL: &str = "claude-3-haiku-20240307";

/// Resolve short model aliases to dated model names
pub fn resolve_model(model: &str) -> &str {
    match model {
        "claude" | "claude-sonnet" | "claude-3-5-sonnet" => CURRENT_SONNET_MODEL,
        "claude-3-sonnet" => "claude-3-sonnet-20240229",
        "claude-opus" | "claude-3-opus" => CURRENT_OPUS_MODEL,
        "claude-haiku" | "claude-3-haiku" => CURRENT_HAIKU_MODEL,
        other => other,
    }
}

pub struct AnthropicProvider {
    client: Client,
    config: AnthropicProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    /// The system prompt travels outside the message list
    fn payload(model: &str, messages: &[ChatMessage], options: &Params) -> Value {
        let (system, rest) = match messages.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(&first.content), rest),
            _ => (None, messages),
        };

        let mut payload = json!({
            "model": resolve_model(model),
            "messages": messages_to_wire(rest),
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
        }
        apply_options(&mut payload, options);
        if payload.get("max_tokens").is_none() {
            payload["max_tokens"] = json!(DEFAULT_MAX_TOKENS);
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.host.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(payload)
            .send()
            .await?;
        check_response(response).await
    }

    fn parse_event(data: &str, index: usize) -> Result<Option<Chunk>> {
        let raw: Value = serde_json::from_str(data)?;
        let text = match raw.get("type").and_then(Value::as_str) {
            Some("content_block_start") => raw.pointer("/content_block/text"),
            Some("content_block_delta") => raw.pointer("/delta/text"),
            Some("error") => return Err(anyhow!("Anthropic stream error: {}", raw["error"])),
            Some(_) => return Ok(None),
            None => None,
        };
        match text.and_then(Value::as_str) {
            Some(text) => Ok(Some(Chunk::new(text, raw.clone()))),
            None => {
                tracing::warn!(chunk = index, "Anthropic event has no text");
                Ok(Some(Chunk::malformed(raw)))
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)> {
        let payload = Self::payload(model, messages, options);
        let response: Value = self.post(&payload).await?.json().await?;

        let content = response
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Invalid response format from Anthropic API"))?
            .to_string();

        Ok((content, response))
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream> {
        let mut payload = Self::payload(model, messages, options);
        payload["stream"] = json!(true);
        let response = self.post(&payload).await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::try_stream! {
            let mut index = 0;
            while let Some(line) = lines.next().await {
                let line = line?;
                if let Some(data) = sse_data(&line) {
                    if let Some(chunk) = Self::parse_event(data, index)? {
                        yield chunk;
                    }
                    index += 1;
                }
            }
        }))
    }

    fn base_url(&self) -> String {
        self.config.host.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use indoc::indoc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(template: ResponseTemplate) -> (MockServer, AnthropicProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test_api_key"))
            .respond_with(template)
            .mount(&mock_server)
            .await;

        let provider = AnthropicProvider::new(AnthropicProviderConfig {
            host: mock_server.uri(),
            api_key: "test_api_key".to_string(),
        })
        .unwrap();
        (mock_server, provider)
    }

    #[test]
    fn test_payload_moves_system_prompt() {
        let messages = vec![
            ChatMessage::new(Role::System, "Be terse."),
            ChatMessage::new(Role::User, "2+2?"),
        ];
        let payload = AnthropicProvider::payload("claude", &messages, &Params::new());
        assert_eq!(payload["model"], json!(CURRENT_SONNET_MODEL));
        assert_eq!(payload["system"], json!("Be terse."));
        assert_eq!(payload["messages"], json!([{"role": "user", "content": "2+2?"}]));
        assert_eq!(payload["max_tokens"], json!(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn test_payload_keeps_explicit_max_tokens() {
        let mut options = Params::new();
        options.insert("max_tokens".into(), json!(64));
        let payload = AnthropicProvider::payload(
            "claude-3-opus-20240229",
            &[ChatMessage::new(Role::User, "hi")],
            &options,
        );
        assert_eq!(payload["max_tokens"], json!(64));
        assert!(payload.get("system").is_none());
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(body_partial_json(json!({"system": "Be terse."})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "4"}]
            })))
            .mount(&mock_server)
            .await;
        let provider = AnthropicProvider::new(AnthropicProviderConfig {
            host: mock_server.uri(),
            api_key: "k".to_string(),
        })?;

        let (text, raw) = provider
            .complete(
                "claude-haiku",
                &[
                    ChatMessage::new(Role::System, "Be terse."),
                    ChatMessage::new(Role::User, "2+2?"),
                ],
                &Params::new(),
            )
            .await?;
        assert_eq!(text, "4");
        assert_eq!(raw["id"], json!("msg_1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_reads_text_events() -> Result<()> {
        let body = indoc! {r#"
            event: message_start
            data: {"type":"message_start","message":{"id":"msg_1"}}

            event: content_block_start
            data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}

            event: content_block_delta
            data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}

            event: content_block_delta
            data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" there"}}

            event: message_stop
            data: {"type":"message_stop"}
        "#};
        let (_server, provider) =
            setup(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")).await;

        let chunks: Vec<Chunk> = provider
            .stream("claude", &[ChatMessage::new(Role::User, "Hi")], &Params::new())
            .await?
            .try_collect()
            .await?;

        assert_eq!(chunks.len(), 3);
        let text: String = chunks.iter().filter_map(|c| c.text.as_deref()).collect();
        assert_eq!(text, "Hello there");
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_error_event() {
        let body = "data: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\"}}\n";
        let (_server, provider) =
            setup(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")).await;

        let result: Result<Vec<Chunk>> = provider
            .stream("claude", &[ChatMessage::new(Role::User, "Hi")], &Params::new())
            .await
            .unwrap()
            .try_collect()
            .await;
        assert!(result.unwrap_err().to_string().contains("overloaded_error"));
    }
}
