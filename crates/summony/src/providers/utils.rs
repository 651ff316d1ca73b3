use anyhow::{anyhow, Result};
use futures::stream::{BoxStream, Stream, StreamExt};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};

use crate::models::message::ChatMessage;
use crate::params::Params;

/// Convert the outbound context to the `[{role, content}]` shape most chat APIs share
pub fn messages_to_wire(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
        .collect()
}

/// Spread generation options into a request payload, leaving existing keys alone
pub fn apply_options(payload: &mut Value, options: &Params) {
    if let Some(object) = payload.as_object_mut() {
        for (key, value) in options {
            object.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// Turn non-success responses into errors carrying the status and body
pub async fn check_response(response: Response) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
            Err(anyhow!("Server error: {}", status))
        }
        status => {
            let error_text = response.text().await.unwrap_or_default();
            Err(anyhow!("Request failed: {} - {}", status, error_text))
        }
    }
}

/// Split a streamed HTTP body into trimmed, non-empty lines
pub fn body_lines(response: Response) -> BoxStream<'static, Result<String>> {
    byte_lines(response.bytes_stream())
}

/// Split a stream of byte chunks into lines, decoding each line only once it is complete
pub fn byte_lines<S, B, E>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| anyhow!("Stream interrupted: {}", e))?;
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = decode_line(&line[..pos])?;
                if !line.is_empty() {
                    yield line;
                }
            }
        }

        let rest = decode_line(&buffer)?;
        if !rest.is_empty() {
            yield rest;
        }
    })
}

fn decode_line(bytes: &[u8]) -> Result<String> {
    let line = std::str::from_utf8(bytes).map_err(|e| anyhow!("Invalid UTF-8 in stream: {}", e))?;
    Ok(line.trim().to_string())
}

/// Extract the payload of an SSE `data:` line
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}
