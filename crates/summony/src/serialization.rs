//! Content-addressed conversation snapshots.
//!
//! A snapshot stores every distinct `(role, content)` pair once, keyed by its
//! hash, and lists for each agent the ids that make up its timeline. Messages
//! shared by several agents (a common system prompt, identical replies) end up
//! in a single record that remembers each agent's parameter version. When one
//! agent repeats a message with a different version or flag, the record keeps
//! that occurrence under its timeline position.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::agent::Agent;
use crate::errors::{AgentError, AgentResult};
use crate::models::message::{Message, ParamsRef};
use crate::models::role::Role;
use crate::models::turn::{Timeline, Turn};
use crate::params::{ParamVersionStore, Params};
use crate::providers::base::Provider;
use crate::providers::factory::ProviderType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub model_name: String,
    /// Agent kind, e.g. `openai` or `anthropic`
    pub class: String,
    #[serde(default)]
    pub params: Params,
}

/// One distinct message, shared by every occurrence with the same role and content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<ParamsRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// Agents whose first occurrence disagrees with `chosen`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chosen_by: BTreeMap<usize, Option<bool>>,
    /// Occurrences that differ from their agent's defaults, keyed by agent
    /// and then by position (`turn` or `turn.member`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub occurrences: BTreeMap<usize, BTreeMap<String, Occurrence>>,
}

/// Version and flags of a single occurrence of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Occurrence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

impl Occurrence {
    fn of(agent: usize, message: &Message) -> Self {
        Self {
            params: message.params.as_ref().and_then(|p| p.version_for(agent)),
            chosen: message.chosen,
            log_path: message.log_path.clone(),
        }
    }
}

impl MessageRecord {
    fn first_seen(agent: usize, message: &Message) -> Self {
        let occurrence = Occurrence::of(agent, message);
        Self {
            role: message.role,
            content: message.content.clone(),
            chosen: occurrence.chosen,
            params: occurrence
                .params
                .map(|version| ParamsRef::PerAgent(BTreeMap::from([(agent, version)]))),
            log_path: occurrence.log_path,
            chosen_by: BTreeMap::new(),
            occurrences: BTreeMap::new(),
        }
    }

    /// Fold another occurrence into this record without dropping its associations.
    ///
    /// The first occurrence of each agent sets that agent's defaults; any
    /// occurrence that differs from them is kept under its position.
    fn merge(&mut self, agent: usize, position: &str, message: &Message, first_for_agent: bool) {
        let occurrence = Occurrence::of(agent, message);
        if first_for_agent {
            if let Some(version) = occurrence.params {
                let mut versions = match self.params.take() {
                    Some(ParamsRef::PerAgent(versions)) => versions,
                    Some(ParamsRef::Version(version)) => BTreeMap::from([(agent, version)]),
                    None => BTreeMap::new(),
                };
                versions.insert(agent, version);
                self.params = Some(ParamsRef::PerAgent(versions));
            }
            if occurrence.chosen != self.chosen {
                self.chosen_by.insert(agent, occurrence.chosen);
            }
        }
        if occurrence != self.defaults_for(agent) {
            self.occurrences
                .entry(agent)
                .or_default()
                .insert(position.to_string(), occurrence);
        }
    }

    fn defaults_for(&self, agent: usize) -> Occurrence {
        Occurrence {
            params: self.params.as_ref().and_then(|p| p.version_for(agent)),
            chosen: self.chosen_by.get(&agent).copied().unwrap_or(self.chosen),
            log_path: self.log_path.clone(),
        }
    }

    fn to_message(&self, agent: usize, position: &str) -> Message {
        let occurrence = self
            .occurrences
            .get(&agent)
            .and_then(|positions| positions.get(position))
            .cloned()
            .unwrap_or_else(|| self.defaults_for(agent));
        Message {
            role: self.role,
            content: self.content.clone(),
            chosen: occurrence.chosen,
            params: occurrence.params.map(ParamsRef::Version),
            log_path: occurrence.log_path,
        }
    }
}

fn position(turn: usize, member: Option<usize>) -> String {
    match member {
        Some(member) => format!("{}.{}", turn, member),
        None => turn.to_string(),
    }
}

/// A timeline position: one message id, or the ids of a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageRef {
    Id(String),
    Branch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub agents: Vec<AgentDescriptor>,
    pub messages: BTreeMap<String, MessageRecord>,
    pub agent_messages: BTreeMap<usize, Vec<MessageRef>>,
    pub params: BTreeMap<usize, ParamVersionStore>,
}

/// Content id of a message: hex SHA-256 of the JSON array `[role, content]`
pub fn message_id(role: Role, content: &str) -> String {
    let key = json!([role, content]).to_string();
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

/// Capture every agent's timeline and parameter history.
///
/// Fails if an agent has no kind to record, since it could not be rebuilt.
pub fn to_snapshot(agents: &[Agent]) -> AgentResult<Snapshot> {
    let mut snapshot = Snapshot {
        agents: Vec::with_capacity(agents.len()),
        messages: BTreeMap::new(),
        agent_messages: BTreeMap::new(),
        params: BTreeMap::new(),
    };

    for (index, agent) in agents.iter().enumerate() {
        let kind = agent.kind().ok_or_else(|| {
            AgentError::UnknownAgentKind(format!("agent {} has no kind", agent.name()))
        })?;
        snapshot.agents.push(AgentDescriptor {
            name: agent.name().to_string(),
            model_name: agent.model().to_string(),
            class: kind.to_string(),
            params: agent.params().clone(),
        });

        let mut seen = HashSet::new();
        let mut refs = Vec::with_capacity(agent.timeline().len());
        for (turn_index, turn) in agent.timeline().turns().iter().enumerate() {
            let reference = match turn {
                Turn::Single(message) => MessageRef::Id(add_message(
                    &mut snapshot,
                    &mut seen,
                    index,
                    &position(turn_index, None),
                    message,
                )),
                Turn::Branch(members) => MessageRef::Branch(
                    members
                        .iter()
                        .enumerate()
                        .map(|(member, message)| {
                            add_message(
                                &mut snapshot,
                                &mut seen,
                                index,
                                &position(turn_index, Some(member)),
                                message,
                            )
                        })
                        .collect(),
                ),
            };
            refs.push(reference);
        }
        snapshot.agent_messages.insert(index, refs);
        snapshot.params.insert(index, agent.param_versions().clone());
    }

    tracing::debug!(
        agents = snapshot.agents.len(),
        messages = snapshot.messages.len(),
        "captured snapshot"
    );
    Ok(snapshot)
}

fn add_message(
    snapshot: &mut Snapshot,
    seen: &mut HashSet<String>,
    agent: usize,
    position: &str,
    message: &Message,
) -> String {
    let id = message_id(message.role, &message.content);
    let first_for_agent = seen.insert(id.clone());
    match snapshot.messages.entry(id.clone()) {
        Entry::Occupied(mut entry) => {
            entry
                .get_mut()
                .merge(agent, position, message, first_for_agent)
        }
        Entry::Vacant(entry) => {
            entry.insert(MessageRecord::first_seen(agent, message));
        }
    }
    id
}

/// Rebuild agents from a snapshot.
///
/// `builder` supplies the provider for each agent. Any unknown kind, missing
/// message or failed provider aborts the whole reconstruction.
pub fn from_snapshot<F>(snapshot: &Snapshot, mut builder: F) -> AgentResult<Vec<Agent>>
where
    F: FnMut(ProviderType, &AgentDescriptor) -> anyhow::Result<Arc<dyn Provider>>,
{
    let mut agents = Vec::with_capacity(snapshot.agents.len());
    for (index, descriptor) in snapshot.agents.iter().enumerate() {
        let kind = ProviderType::from_kind(&descriptor.class)?;
        let store = snapshot
            .params
            .get(&index)
            .cloned()
            .ok_or(AgentError::MissingParams(index))?;

        let mut turns = Vec::new();
        let references = snapshot.agent_messages.get(&index).into_iter().flatten();
        for (turn_index, reference) in references.enumerate() {
            let turn = match reference {
                MessageRef::Id(id) => {
                    Turn::Single(rehydrate(snapshot, index, id, &position(turn_index, None))?)
                }
                MessageRef::Branch(ids) => Turn::Branch(
                    ids.iter()
                        .enumerate()
                        .map(|(member, id)| {
                            rehydrate(snapshot, index, id, &position(turn_index, Some(member)))
                        })
                        .collect::<AgentResult<Vec<_>>>()?,
                ),
            };
            turns.push(turn);
        }
        let timeline = Timeline::from_turns(turns)?;

        let provider = builder(kind, descriptor).map_err(|e| {
            AgentError::Internal(format!(
                "could not build a provider for {}: {:#}",
                descriptor.name, e
            ))
        })?;

        agents.push(Agent::restore(
            descriptor.name.clone(),
            descriptor.model_name.clone(),
            kind,
            descriptor.params.clone(),
            store,
            timeline,
            provider,
        ));
    }
    Ok(agents)
}

fn rehydrate(snapshot: &Snapshot, agent: usize, id: &str, position: &str) -> AgentResult<Message> {
    snapshot
        .messages
        .get(id)
        .map(|record| record.to_message(agent, position))
        .ok_or_else(|| AgentError::MissingMessage(id.to_string()))
}

pub fn to_json_string(snapshot: &Snapshot) -> AgentResult<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

pub fn from_json_str(json: &str) -> AgentResult<Snapshot> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{ModelCall, ModelCallLogger, NullLogger};
    use crate::providers::mock::MockProvider;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_builder(_kind: ProviderType, _descriptor: &AgentDescriptor) -> anyhow::Result<Arc<dyn Provider>> {
        Ok(Arc::new(MockProvider::default()))
    }

    fn agent(name: &str, model: &str, provider: &MockProvider) -> Agent {
        Agent::new(Some(name), model, Arc::new(provider.clone()), Arc::new(NullLogger))
            .with_system_prompt("You are helpful.")
    }

    fn temperature(value: f64) -> Params {
        let mut params = Params::new();
        params.insert("temperature".into(), json!(value));
        params
    }

    /// Two agents sharing a system prompt, with branches and a selection
    async fn sample_agents() -> AgentResult<Vec<Agent>> {
        let first = MockProvider::with_texts(&["4", "Four.", "You're welcome"]);
        let second = MockProvider::with_texts(&["4", "It is 4"]);

        let mut alice = agent("alice", "gpt-4o", &first);
        alice.ask("2+2?", None, &Params::new()).await?;
        alice.continue_with_alternate(&temperature(0.9)).await?;
        alice.select_alternate(2, 0)?;
        alice.ask("thanks", None, &Params::new()).await?;

        let mut bob = agent("bob", "claude", &second).with_params(temperature(0.2));
        bob.ask("2+2?", None, &Params::new()).await?;
        bob.continue_with_alternate(&temperature(0.5)).await?;

        Ok(vec![alice, bob])
    }

    #[tokio::test]
    async fn test_round_trip_preserves_timelines() -> AgentResult<()> {
        let agents = sample_agents().await?;
        let snapshot = to_snapshot(&agents)?;
        let restored = from_snapshot(&from_json_str(&to_json_string(&snapshot)?)?, mock_builder)?;

        assert_eq!(restored.len(), 2);
        for (original, copy) in agents.iter().zip(&restored) {
            assert_eq!(copy.name(), original.name());
            assert_eq!(copy.model(), original.model());
            assert_eq!(copy.kind(), original.kind());
            assert_eq!(copy.params(), original.params());
            assert_eq!(copy.param_versions(), original.param_versions());
            assert_eq!(copy.timeline(), original.timeline());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_shared_messages_merge_params() -> AgentResult<()> {
        let agents = sample_agents().await?;
        let snapshot = to_snapshot(&agents)?;

        // system prompt, "2+2?", "4" are shared; "Four.", "thanks", "You're welcome", "It is 4" are not
        assert_eq!(snapshot.messages.len(), 7);

        let reply = &snapshot.messages[&message_id(Role::Assistant, "4")];
        assert_eq!(
            reply.params,
            Some(ParamsRef::PerAgent(BTreeMap::from([(0, 0), (1, 0)])))
        );
        // alice chose "4", bob never chose
        assert_eq!(reply.chosen, Some(true));
        assert_eq!(reply.chosen_by, BTreeMap::from([(1, None)]));
        assert!(reply.occurrences.is_empty());

        let bob_alt = &snapshot.messages[&message_id(Role::Assistant, "It is 4")];
        assert_eq!(
            bob_alt.params,
            Some(ParamsRef::PerAgent(BTreeMap::from([(1, 1)])))
        );
        assert_eq!(
            snapshot.agent_messages[&1][2],
            MessageRef::Branch(vec![
                message_id(Role::Assistant, "4"),
                message_id(Role::Assistant, "It is 4"),
            ])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_identical_alternates_keep_their_own_version_and_flag() -> AgentResult<()> {
        let provider = MockProvider::with_texts(&["4", "4"]);
        let mut alice = agent("alice", "gpt-4o", &provider);
        alice.ask("2+2?", None, &Params::new()).await?;
        alice.continue_with_alternate(&temperature(0.9)).await?;
        alice.select_alternate(2, 1)?;

        let snapshot = to_snapshot(std::slice::from_ref(&alice))?;
        let reply = &snapshot.messages[&message_id(Role::Assistant, "4")];
        assert_eq!(
            reply.occurrences[&0],
            BTreeMap::from([(
                "2.1".to_string(),
                Occurrence {
                    params: Some(1),
                    chosen: Some(true),
                    log_path: None,
                }
            )])
        );

        let restored = from_snapshot(&from_json_str(&to_json_string(&snapshot)?)?, mock_builder)?;
        let branch = &restored[0].timeline().turns()[2];
        let versions: Vec<_> = branch.members().iter().map(|m| m.params.clone()).collect();
        let chosen: Vec<_> = branch.members().iter().map(|m| m.chosen).collect();
        assert_eq!(
            versions,
            vec![Some(ParamsRef::Version(0)), Some(ParamsRef::Version(1))]
        );
        assert_eq!(chosen, vec![Some(false), Some(true)]);
        assert_eq!(branch.chosen_index(), Some(1));
        assert_eq!(restored[0].timeline(), alice.timeline());
        Ok(())
    }

    /// Hands out `call-1`, `call-2`, ...
    #[derive(Default)]
    struct CountingLogger {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ModelCallLogger for CountingLogger {
        async fn log_model_call(&self, _call: &ModelCall) -> Option<String> {
            Some(format!("call-{}", self.calls.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    #[tokio::test]
    async fn test_repeated_reply_across_prompts_round_trips() -> AgentResult<()> {
        let provider = MockProvider::with_texts(&["4", "4"]);
        let mut alice =
            agent("alice", "gpt-4o", &provider).with_logger(Arc::new(CountingLogger::default()));
        alice.ask("2+2?", None, &Params::new()).await?;
        alice.ask("And 3+1?", None, &temperature(0.5)).await?;

        let snapshot = to_snapshot(std::slice::from_ref(&alice))?;
        assert_eq!(snapshot.messages.len(), 4);

        let restored = from_snapshot(&snapshot, mock_builder)?;
        let turns = restored[0].timeline().turns();
        assert_eq!(turns[2].resolved().params, Some(ParamsRef::Version(0)));
        assert_eq!(turns[2].resolved().log_path.as_deref(), Some("call-1"));
        assert_eq!(turns[4].resolved().params, Some(ParamsRef::Version(1)));
        assert_eq!(turns[4].resolved().log_path.as_deref(), Some("call-2"));
        assert_eq!(restored[0].timeline(), alice.timeline());
        Ok(())
    }

    #[test]
    fn test_message_id_depends_on_role_and_content() {
        let id = message_id(Role::User, "hi");
        assert_eq!(id.len(), 64);
        assert_eq!(id, message_id(Role::User, "hi"));
        assert_ne!(id, message_id(Role::Assistant, "hi"));
        assert_ne!(id, message_id(Role::User, "hi "));
    }

    #[tokio::test]
    async fn test_missing_message_is_fatal() -> AgentResult<()> {
        let mut snapshot = to_snapshot(&sample_agents().await?)?;
        let id = message_id(Role::User, "thanks");
        snapshot.messages.remove(&id);

        let result = from_snapshot(&snapshot, mock_builder);
        assert_eq!(result.err(), Some(AgentError::MissingMessage(id)));
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_kind_and_missing_params_are_fatal() -> AgentResult<()> {
        let mut snapshot = to_snapshot(&sample_agents().await?)?;
        snapshot.agents[1].class = "palm".to_string();
        assert_eq!(
            from_snapshot(&snapshot, mock_builder).err(),
            Some(AgentError::UnknownAgentKind("palm".to_string()))
        );

        snapshot.agents[1].class = "anthropic".to_string();
        snapshot.params.remove(&1);
        assert_eq!(
            from_snapshot(&snapshot, mock_builder).err(),
            Some(AgentError::MissingParams(1))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_builder_failure_aborts() -> AgentResult<()> {
        let snapshot = to_snapshot(&sample_agents().await?)?;
        let result = from_snapshot(&snapshot, |_, _| Err(anyhow::anyhow!("no credentials")));
        assert!(matches!(result, Err(AgentError::Internal(msg)) if msg.contains("no credentials")));
        Ok(())
    }

    #[test]
    fn test_kindless_agent_cannot_be_captured() {
        let agent = agent("carol", "custom-model", &MockProvider::default());
        assert!(matches!(
            to_snapshot(&[agent]),
            Err(AgentError::UnknownAgentKind(_))
        ));
    }

    #[test]
    fn test_snapshot_json_layout() -> AgentResult<()> {
        let json = r#"{
            "agents": [{"name": "a", "model_name": "dummy", "class": "dummy", "params": {}}],
            "messages": {
                "m1": {"role": "system", "content": "Be brief."},
                "m2": {"role": "user", "content": "hi"},
                "m3": {"role": "assistant", "content": "hello", "params": {"0": 0}, "chosen": false},
                "m4": {"role": "assistant", "content": "hey", "params": {"0": 1}, "chosen": true}
            },
            "agent_messages": {"0": ["m1", "m2", ["m3", "m4"]]},
            "params": {"0": [{}, {"temperature": 1.0}]}
        }"#;
        let snapshot = from_json_str(json)?;
        let agents = from_snapshot(&snapshot, mock_builder)?;

        let timeline = agents[0].timeline();
        assert_eq!(timeline.len(), 3);
        assert_eq!(timeline.turns()[2].chosen_index(), Some(1));
        assert_eq!(
            timeline.turns()[2].members()[1].params,
            Some(ParamsRef::Version(1))
        );
        assert_eq!(agents[0].param_versions().len(), 2);
        assert_eq!(agents[0].last_text(), Some("hey"));

        assert!(matches!(
            from_json_str("{\"agents\": 3}"),
            Err(AgentError::MalformedSnapshot(_))
        ));
        Ok(())
    }
}
