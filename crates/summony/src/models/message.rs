use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::role::Role;

/// Reference from a message to the parameter versions it was generated with.
///
/// A message owned by a single agent points at one index in that agent's
/// parameter store. Once identical messages from several agents are merged
/// in a snapshot, the reference becomes a map of agent index to version index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamsRef {
    Version(usize),
    PerAgent(BTreeMap<usize, usize>),
}

impl ParamsRef {
    /// The version index that applies to `agent`
    pub fn version_for(&self, agent: usize) -> Option<usize> {
        match self {
            ParamsRef::Version(version) => Some(*version),
            ParamsRef::PerAgent(versions) => versions.get(&agent).copied(),
        }
    }
}

// JSON object keys are always strings, so the per-agent map is parsed by hand
impl<'de> Deserialize<'de> for ParamsRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .map(|v| ParamsRef::Version(v as usize))
                .ok_or_else(|| D::Error::custom(format!("invalid params version: {}", n))),
            Value::Object(map) => {
                let mut versions = BTreeMap::new();
                for (agent, version) in map {
                    let agent = agent
                        .parse::<usize>()
                        .map_err(|_| D::Error::custom(format!("invalid agent index: {}", agent)))?;
                    let version = version
                        .as_u64()
                        .ok_or_else(|| D::Error::custom(format!("invalid params version: {}", version)))?;
                    versions.insert(agent, version as usize);
                }
                Ok(ParamsRef::PerAgent(versions))
            }
            other => Err(D::Error::custom(format!(
                "expected a version index or an agent map, got {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParamsRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Message {
    pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
        Message {
            role,
            content: content.into(),
            chosen: None,
            params: None,
            log_path: None,
        }
    }

    /// Create a new system message
    pub fn system<S: Into<String>>(content: S) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a new user message
    pub fn user<S: Into<String>>(content: S) -> Self {
        Self::new(Role::User, content)
    }

    /// Create a new assistant message
    pub fn assistant<S: Into<String>>(content: S) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attach the parameter version this message was generated with
    pub fn with_params_version(mut self, version: usize) -> Self {
        self.params = Some(ParamsRef::Version(version));
        self
    }

    pub fn with_chosen(mut self, chosen: bool) -> Self {
        self.chosen = Some(chosen);
        self
    }

    pub fn is_chosen(&self) -> bool {
        self.chosen.unwrap_or(false)
    }

    /// Project onto the plain role/content pair sent to a provider
    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// One entry of the outbound context handed to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new<S: Into<String>>(role: Role, content: S) -> Self {
        ChatMessage {
            role,
            content: content.into(),
        }
    }
}
