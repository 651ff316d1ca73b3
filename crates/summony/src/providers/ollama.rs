use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::base::{Chunk, ChunkStream, Provider};
use super::configs::OllamaProviderConfig;
use super::utils::{body_lines, check_response, messages_to_wire};
use crate::models::message::ChatMessage;
use crate::params::Params;

pub const OLLAMA_MODEL_PREFIX: &str = "ollama::";

pub struct OllamaProvider {
    client: Client,
    config: OllamaProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn payload(model: &str, messages: &[ChatMessage], options: &Params, stream: bool) -> Value {
        let model = model.strip_prefix(OLLAMA_MODEL_PREFIX).unwrap_or(model);
        let mut payload = json!({
            "model": model,
            "messages": messages_to_wire(messages),
            "stream": stream,
        });
        if !options.is_empty() {
            payload["options"] = Value::Object(options.clone());
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.config.host.trim_end_matches('/'));

        let mut request = self.client.post(&url).json(payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }
        check_response(request.send().await?).await
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<(String, Value)> {
        let payload = Self::payload(model, messages, options, false);
        let response: Value = self.post(&payload).await?.json().await?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("Ollama error: {}", error));
        }
        let content = response
            .pointer("/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Invalid response format from Ollama"))?
            .to_string();

        Ok((content, response))
    }

    async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &Params,
    ) -> Result<ChunkStream> {
        let payload = Self::payload(model, messages, options, true);
        let response = self.post(&payload).await?;
        let mut lines = body_lines(response);

        Ok(Box::pin(async_stream::try_stream! {
            let mut index = 0;
            while let Some(line) = lines.next().await {
                let raw: Value = serde_json::from_str(&line?)?;
                if let Some(error) = raw.get("error") {
                    Err::<(), _>(anyhow!("Ollama error: {}", error))?;
                }
                let done = raw.get("done").and_then(Value::as_bool).unwrap_or(false);
                match raw.pointer("/message/content").and_then(Value::as_str) {
                    Some(text) => {
                        yield Chunk::new(text, raw.clone());
                    }
                    None => {
                        tracing::warn!(chunk = index, "Ollama chunk has no message content");
                        yield Chunk::malformed(raw);
                    }
                }
                index += 1;
                if done {
                    break;
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
    use crate::models::role::Role;
    use futures::TryStreamExt;
    use indoc::indoc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn _setup_mock_server(template: ResponseTemplate) -> (MockServer, OllamaProvider) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(template)
            .mount(&mock_server)
            .await;

        let provider = OllamaProvider::new(OllamaProviderConfig {
            host: mock_server.uri(),
            api_key: None,
        })
        .unwrap();
        (mock_server, provider)
    }

    #[test]
    fn test_payload_strips_prefix_and_nests_options() {
        let mut options = Params::new();
        options.insert("temperature".into(), json!(0.2));
        let payload = OllamaProvider::payload(
            "ollama::llama3.2",
            &[ChatMessage::new(Role::User, "hi")],
            &options,
            false,
        );
        assert_eq!(payload["model"], json!("llama3.2"));
        assert_eq!(payload["options"], json!({"temperature": 0.2}));
        assert_eq!(payload["stream"], json!(false));
    }

    #[tokio::test]
    async fn test_complete_basic() -> Result<()> {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({"model": "qwen2.5", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "qwen2.5",
                "message": {"role": "assistant", "content": "4"},
                "done": true
            })))
            .mount(&mock_server)
            .await;
        let provider = OllamaProvider::new(OllamaProviderConfig {
            host: mock_server.uri(),
            api_key: None,
        })?;

        let (text, raw) = provider
            .complete(
                "ollama::qwen2.5",
                &[ChatMessage::new(Role::User, "2+2?")],
                &Params::new(),
            )
            .await?;
        assert_eq!(text, "4");
        assert_eq!(raw["done"], json!(true));
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_reads_ndjson() -> Result<()> {
        let body = indoc! {r#"
            {"model":"qwen2.5","message":{"role":"assistant","content":"Hel"},"done":false}
            {"model":"qwen2.5","message":{"role":"assistant","content":"lo"},"done":false}
            {"model":"qwen2.5","done":false}
            {"model":"qwen2.5","message":{"role":"assistant","content":""},"done":true}
        "#};
        let (_server, provider) =
            _setup_mock_server(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
                .await;

        let chunks: Vec<Chunk> = provider
            .stream("qwen2.5", &[ChatMessage::new(Role::User, "Hi")], &Params::new())
            .await?
            .try_collect()
            .await?;

        assert_eq!(chunks.len(), 4);
        assert!(chunks[2].text.is_none());
        let text: String = chunks.iter().filter_map(|c| c.text.as_deref()).collect();
        assert_eq!(text, "Hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_request_failed_includes_body() {
        let (_server, provider) = _setup_mock_server(
            ResponseTemplate::new(404).set_body_string("model 'nope' not found"),
        )
        .await;
        let err = provider
            .complete("nope", &[ChatMessage::new(Role::User, "Hi")], &Params::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
