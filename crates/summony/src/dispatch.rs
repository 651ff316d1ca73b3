use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use futures::stream::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::agent::{Agent, Request};
use crate::errors::{AgentError, AgentResult};
use crate::logger::ModelCallLogger;
use crate::params::Params;
use crate::providers::base::Provider;
use crate::providers::factory::{provider_for_kind, ProviderType};
use crate::serialization::{from_json_str, from_snapshot, to_json_string, to_snapshot, AgentDescriptor};

/// How one agent fared in a round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutcome {
    pub agent: usize,
    pub name: String,
    /// Everything received, even when the reply failed part way
    pub text: String,
    pub error: Option<AgentError>,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-agent outcomes of a dispatch round, in target order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub outcomes: Vec<AgentOutcome>,
}

impl RoundReport {
    pub fn succeeded(&self) -> Vec<&AgentOutcome> {
        self.outcomes.iter().filter(|o| o.is_success()).collect()
    }

    pub fn failed(&self) -> Vec<&AgentOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success()).collect()
    }

    /// Final (or partial) text per agent index
    pub fn texts(&self) -> Vec<(usize, &str)> {
        self.outcomes
            .iter()
            .map(|o| (o.agent, o.text.as_str()))
            .collect()
    }
}

/// State of a round after an increment arrived
#[derive(Debug, Clone, Copy)]
pub struct RoundUpdate<'a> {
    /// Agent the increment belongs to
    pub agent: usize,
    pub delta: &'a str,
    /// Text so far for every target, in target order
    pub texts: &'a [(usize, String)],
}

/// A set of agents talking in parallel
pub struct Conversation {
    agents: Vec<Agent>,
    active: Vec<bool>,
}

impl Conversation {
    /// Every agent starts active
    pub fn new(agents: Vec<Agent>) -> Self {
        let active = vec![true; agents.len()];
        Self { agents, active }
    }

    /// One default agent per model identifier, with providers configured from the environment
    pub fn from_models<L>(
        models: &[String],
        system_prompt: Option<&str>,
        params: &Params,
        logger_for: L,
    ) -> anyhow::Result<Self>
    where
        L: Fn(&str) -> Arc<dyn ModelCallLogger>,
    {
        Self::from_models_with(models, system_prompt, params, logger_for, |kind, _| {
            provider_for_kind(kind)
        })
    }

    /// Like [`Conversation::from_models`], with providers coming from `builder`
    pub fn from_models_with<L, B>(
        models: &[String],
        system_prompt: Option<&str>,
        params: &Params,
        logger_for: L,
        mut builder: B,
    ) -> anyhow::Result<Self>
    where
        L: Fn(&str) -> Arc<dyn ModelCallLogger>,
        B: FnMut(ProviderType, &str) -> anyhow::Result<Arc<dyn Provider>>,
    {
        let mut agents = Vec::with_capacity(models.len());
        for model in models {
            let kind = ProviderType::for_model(model)?;
            let provider = builder(kind, model)
                .with_context(|| format!("Failed to set up a {} provider for {}", kind, model))?;
            let mut agent = Agent::new(None, model, provider, logger_for(model))
                .with_kind(kind)
                .with_params(params.clone());
            if let Some(prompt) = system_prompt {
                agent = agent.with_system_prompt(prompt);
            }
            agents.push(agent);
        }
        Ok(Self::new(agents))
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    pub fn agent(&self, index: usize) -> AgentResult<&Agent> {
        self.agents.get(index).ok_or(AgentError::UnknownAgent(index))
    }

    pub fn agent_mut(&mut self, index: usize) -> AgentResult<&mut Agent> {
        self.agents.get_mut(index).ok_or(AgentError::UnknownAgent(index))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Make exactly `indices` active
    pub fn set_active(&mut self, indices: &[usize]) -> AgentResult<()> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.agents.len()) {
            return Err(AgentError::UnknownAgent(bad));
        }
        for (i, active) in self.active.iter_mut().enumerate() {
            *active = indices.contains(&i);
        }
        Ok(())
    }

    pub fn set_agent_active(&mut self, index: usize, active: bool) -> AgentResult<()> {
        let slot = self
            .active
            .get_mut(index)
            .ok_or(AgentError::UnknownAgent(index))?;
        *slot = active;
        Ok(())
    }

    pub fn active_agents(&self) -> Vec<usize> {
        (0..self.agents.len()).filter(|&i| self.active[i]).collect()
    }

    /// Choose alternate `alt` of the last turn of `agent`
    pub fn select_alternate(&mut self, agent: usize, alt: usize) -> AgentResult<()> {
        let agent = self.agent_mut(agent)?;
        let turn = agent.timeline().len().checked_sub(1).ok_or_else(|| {
            AgentError::InvalidAlternate(format!("{} has no turns", agent.name()))
        })?;
        agent.select_alternate(turn, alt)
    }

    /// Set one base parameter on every agent
    pub fn set_param(&mut self, key: &str, value: serde_json::Value) {
        for agent in &mut self.agents {
            let mut params = agent.params().clone();
            params.insert(key.to_string(), value.clone());
            agent.set_params(params);
        }
    }

    fn resolve_targets(&self, targets: Option<&[usize]>) -> AgentResult<Vec<usize>> {
        let Some(targets) = targets else {
            return Ok(self.active_agents());
        };
        let mut resolved = Vec::with_capacity(targets.len());
        for &index in targets {
            match self.active.get(index) {
                None => return Err(AgentError::UnknownAgent(index)),
                Some(false) => return Err(AgentError::InactiveAgent(index)),
                Some(true) if !resolved.contains(&index) => resolved.push(index),
                Some(true) => {}
            }
        }
        Ok(resolved)
    }

    /// Send a prompt, or a re-ask when `prompt` is `None`, to several agents at once.
    ///
    /// Targets default to the active agents. Every usage error is raised before
    /// any agent is touched. Replies stream concurrently; `on_update` sees each
    /// increment together with every target's text so far. A failing agent does
    /// not stop the others and shows up in the report with its partial text.
    pub async fn dispatch<F>(
        &mut self,
        prompt: Option<&str>,
        prefill: Option<&str>,
        targets: Option<&[usize]>,
        overrides: &Params,
        mut on_update: F,
    ) -> AgentResult<RoundReport>
    where
        F: FnMut(RoundUpdate<'_>),
    {
        let request = Request::from_parts(prompt, prefill)?;
        let targets = self.resolve_targets(targets)?;
        for &index in &targets {
            self.agents[index].check(&request)?;
        }
        tracing::info!(targets = ?targets, reask = request.is_alternate(), "dispatching round");

        let mut slots: Vec<Option<&mut Agent>> = self.agents.iter_mut().map(Some).collect();
        let mut streams = Vec::with_capacity(targets.len());
        for &index in &targets {
            let agent = slots[index]
                .take()
                .ok_or_else(|| AgentError::Internal(format!("agent {} targeted twice", index)))?;
            let name = agent.name().to_string();
            let stream = agent.stream_request(request.clone(), overrides.clone())?;
            streams.push((index, name, stream));
        }

        let (tx, rx) = mpsc::channel::<(usize, String)>(100);
        let tasks: Vec<_> = streams
            .into_iter()
            .map(|(index, name, mut stream)| {
                let tx = tx.clone();
                async move {
                    let mut text = String::new();
                    let mut error = None;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(delta) => {
                                text.push_str(&delta);
                                // the receiver only goes away once every task is done
                                let _ = tx.send((index, delta)).await;
                            }
                            Err(err) => {
                                tracing::warn!(agent = %name, error = %err, "agent failed this round");
                                error = Some(err);
                                break;
                            }
                        }
                    }
                    AgentOutcome {
                        agent: index,
                        name,
                        text,
                        error,
                    }
                }
            })
            .collect();
        drop(tx);

        let mut texts: Vec<(usize, String)> = targets.iter().map(|&i| (i, String::new())).collect();
        let collect = async {
            let mut deltas = ReceiverStream::new(rx);
            while let Some((agent, delta)) = deltas.next().await {
                if let Some(entry) = texts.iter_mut().find(|(i, _)| *i == agent) {
                    entry.1.push_str(&delta);
                }
                on_update(RoundUpdate {
                    agent,
                    delta: &delta,
                    texts: &texts,
                });
            }
        };

        let (outcomes, ()) = futures::join!(join_all(tasks), collect);
        let report = RoundReport { outcomes };
        tracing::info!(
            succeeded = report.succeeded().len(),
            failed = report.failed().len(),
            "round finished"
        );
        Ok(report)
    }

    /// Write the conversation as a pretty JSON snapshot
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = to_json_string(&to_snapshot(&self.agents)?)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
        Ok(())
    }

    /// Read a snapshot written by [`Conversation::save`]
    pub fn load<B, L>(path: &Path, builder: B, logger_for: L) -> anyhow::Result<Self>
    where
        B: FnMut(ProviderType, &AgentDescriptor) -> anyhow::Result<Arc<dyn Provider>>,
        L: Fn(&str) -> Arc<dyn ModelCallLogger>,
    {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot from {}", path.display()))?;
        let agents = from_snapshot(&from_json_str(&json)?, builder)?
            .into_iter()
            .map(|agent| {
                let logger = logger_for(agent.name());
                agent.with_logger(logger)
            })
            .collect();
        Ok(Self::new(agents))
    }
}
