//! Raw model-call logging.
//!
//! Every generation call an agent makes is handed to its [`ModelCallLogger`],
//! which may persist it and return a reference that ends up on the resulting
//! message. Logging never fails the call it describes.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::message::ChatMessage;
use crate::params::Params;

/// Everything known about one request to a provider and its outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCall {
    pub base_url: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub options: Params,
    pub stream: bool,
    /// The raw response, or the list of raw chunks for streamed calls
    pub response: Option<Value>,
    pub error: Option<String>,
}

impl ModelCall {
    /// The JSON record written for this call
    pub fn record(&self) -> Value {
        let mut request = json!({
            "request_base_url": self.base_url,
            "model": self.model,
            "messages": self.messages,
            "stream": self.stream,
        });
        if let Some(object) = request.as_object_mut() {
            for (key, value) in &self.options {
                object.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let mut record = json!({ "request": request });
        if let Some(response) = &self.response {
            record["response"] = response.clone();
        }
        if let Some(error) = &self.error {
            record["error"] = json!({ "error": error });
        }
        record
    }
}

#[async_trait]
pub trait ModelCallLogger: Send + Sync {
    /// Persist `call`, returning a reference to the stored record if there is one
    async fn log_model_call(&self, call: &ModelCall) -> Option<String>;
}

/// Discards every call
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

#[async_trait]
impl ModelCallLogger for NullLogger {
    async fn log_model_call(&self, _call: &ModelCall) -> Option<String> {
        None
    }
}

/// Writes one pretty-printed JSON file per call into a per-agent directory
#[derive(Debug, Clone)]
pub struct JsonFileLogger {
    root: PathBuf,
    dir_name: String,
}

impl JsonFileLogger {
    pub fn new<P: Into<PathBuf>>(root: P, agent_name: &str) -> Self {
        let suffix = &Uuid::new_v4().simple().to_string()[..4];
        let dir_name = format!(
            "agent-{}-{}-{}",
            agent_name,
            Utc::now().timestamp_millis(),
            suffix
        );
        Self {
            root: root.into(),
            dir_name,
        }
    }

    /// Directory the records of this logger go to
    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.dir_name)
    }

    /// Resolve a reference returned by `log_model_call` to a file path
    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }

    async fn write(&self, call: &ModelCall) -> Result<String> {
        let dir = self.dir();
        fs::create_dir_all(&dir).await?;

        let file_name = format!(
            "{}_{}.json",
            Utc::now().format("%Y-%m-%d_%H-%M-%S-%6f"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        let json = serde_json::to_vec_pretty(&call.record())?;
        fs::write(dir.join(&file_name), json).await?;
        Ok(format!("{}/{}", self.dir_name, file_name))
    }
}

#[async_trait]
impl ModelCallLogger for JsonFileLogger {
    async fn log_model_call(&self, call: &ModelCall) -> Option<String> {
        match self.write(call).await {
            Ok(reference) => {
                tracing::debug!(reference = %reference, model = %call.model, "logged model call");
                Some(reference)
            }
            Err(e) => {
                tracing::warn!(error = %e, dir = %self.dir().display(), "failed to log model call");
                None
            }
        }
    }
}
