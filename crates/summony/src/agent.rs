use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};

use crate::errors::{AgentError, AgentResult};
use crate::logger::{ModelCall, ModelCallLogger, NullLogger};
use crate::models::message::{ChatMessage, Message};
use crate::models::role::Role;
use crate::models::turn::{Slot, Timeline};
use crate::params::{merge_params, ParamVersionStore, Params};
use crate::providers::base::Provider;
use crate::providers::factory::ProviderType;

/// Recorded in the raw responses of a turn before each re-ask
pub const REASK_MARKER: &str = "<reask>";

/// Text increments of a reply being generated
pub type ReplyStream<'a> = BoxStream<'a, AgentResult<String>>;

/// What an agent is asked to do in one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Answer a fresh prompt, optionally seeding the reply with `prefill`
    Ask {
        prompt: String,
        prefill: Option<String>,
    },
    /// Produce another alternate for the last assistant turn
    Alternate,
}

impl Request {
    /// Build a request from optional parts; no prompt means re-asking
    pub fn from_parts(prompt: Option<&str>, prefill: Option<&str>) -> AgentResult<Self> {
        match (prompt, prefill) {
            (Some(prompt), prefill) => Ok(Request::Ask {
                prompt: prompt.to_string(),
                prefill: prefill.map(str::to_string),
            }),
            (None, Some(_)) => Err(AgentError::PrefillWithoutPrompt),
            (None, None) => Ok(Request::Alternate),
        }
    }

    pub fn is_alternate(&self) -> bool {
        matches!(self, Request::Alternate)
    }
}

/// Everything fixed before a provider is called
struct PreparedCall {
    version: usize,
    context: Vec<ChatMessage>,
    options: Params,
    reask: bool,
}

/// One conversational endpoint: a model behind a provider, with its own
/// timeline and parameter history
pub struct Agent {
    name: String,
    model: String,
    kind: Option<ProviderType>,
    params: Params,
    store: ParamVersionStore,
    timeline: Timeline,
    raw_responses: BTreeMap<usize, Vec<Value>>,
    provider: Arc<dyn Provider>,
    logger: Arc<dyn ModelCallLogger>,
}

impl Agent {
    /// Create an agent for `model`; the name defaults to the model identifier
    pub fn new(
        name: Option<&str>,
        model: &str,
        provider: Arc<dyn Provider>,
        logger: Arc<dyn ModelCallLogger>,
    ) -> Self {
        let params = Params::new();
        let mut store = ParamVersionStore::new();
        store.store(&params);

        Self {
            name: name.unwrap_or(model).to_string(),
            model: model.to_string(),
            kind: ProviderType::for_model(model).ok(),
            params,
            store,
            timeline: Timeline::new(),
            raw_responses: BTreeMap::new(),
            provider,
            logger,
        }
    }

    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.timeline.set_system_prompt(prompt);
        self
    }

    /// Set the base parameters before any request; they become version 0
    pub fn with_params(mut self, params: Params) -> Self {
        self.store = ParamVersionStore::new();
        self.store.store(&params);
        self.params = params;
        self
    }

    pub fn with_kind(mut self, kind: ProviderType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ModelCallLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Rebuild an agent from its persisted parts
    pub(crate) fn restore(
        name: String,
        model: String,
        kind: ProviderType,
        params: Params,
        store: ParamVersionStore,
        timeline: Timeline,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            name,
            model,
            kind: Some(kind),
            params,
            store,
            timeline,
            raw_responses: BTreeMap::new(),
            provider,
            logger: Arc::new(NullLogger),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn kind(&self) -> Option<ProviderType> {
        self.kind
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn param_versions(&self) -> &ParamVersionStore {
        &self.store
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Replace the base parameters, returning their version
    pub fn set_params(&mut self, params: Params) -> usize {
        self.params = params;
        self.store.store(&self.params)
    }

    /// Raw responses, or raw chunks for streamed replies, recorded for a turn
    pub fn raw_responses(&self, turn: usize) -> &[Value] {
        self.raw_responses
            .get(&turn)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Content of the last turn as it would appear in context
    pub fn last_text(&self) -> Option<&str> {
        self.timeline
            .last()
            .map(|turn| turn.resolved().content.as_str())
    }

    /// Mark one alternate of a branch turn as the one carried forward
    pub fn select_alternate(&mut self, turn: usize, member: usize) -> AgentResult<()> {
        self.timeline.select(turn, member)
    }

    /// Check that `request` can run against the current timeline, without touching it
    pub fn check(&self, request: &Request) -> AgentResult<()> {
        if !request.is_alternate() {
            return Ok(());
        }
        match self.timeline.last() {
            Some(turn) if turn.role() == Role::Assistant => Ok(()),
            Some(turn) => Err(AgentError::NothingToReask(format!(
                "the last turn of {} is a {} message",
                self.name,
                turn.role()
            ))),
            None => Err(AgentError::NothingToReask(format!(
                "{} has no turns yet",
                self.name
            ))),
        }
    }

    /// Answer a fresh prompt and append the reply
    pub async fn ask(
        &mut self,
        prompt: &str,
        prefill: Option<&str>,
        overrides: &Params,
    ) -> AgentResult<String> {
        let request = Request::Ask {
            prompt: prompt.to_string(),
            prefill: prefill.map(str::to_string),
        };
        self.complete_request(&request, overrides).await
    }

    /// Generate another alternate reply to the last prompt
    pub async fn continue_with_alternate(&mut self, overrides: &Params) -> AgentResult<String> {
        self.complete_request(&Request::Alternate, overrides).await
    }

    /// Streaming counterpart of [`Agent::ask`]
    pub fn ask_stream(
        &mut self,
        prompt: &str,
        prefill: Option<&str>,
        overrides: &Params,
    ) -> AgentResult<ReplyStream<'_>> {
        let request = Request::Ask {
            prompt: prompt.to_string(),
            prefill: prefill.map(str::to_string),
        };
        self.stream_request(request, overrides.clone())
    }

    /// Streaming counterpart of [`Agent::continue_with_alternate`]
    pub fn alternate_stream(&mut self, overrides: &Params) -> AgentResult<ReplyStream<'_>> {
        self.stream_request(Request::Alternate, overrides.clone())
    }

    /// Run `request` without streaming.
    ///
    /// On failure the timeline is restored to what it was before the call.
    pub async fn complete_request(
        &mut self,
        request: &Request,
        overrides: &Params,
    ) -> AgentResult<String> {
        self.check(request)?;
        let checkpoint = self.timeline.len();
        let call = self.prepare(request, overrides);
        tracing::debug!(agent = %self.name, model = %self.model, version = call.version, "asking");

        let result = self
            .provider
            .complete(&self.model, &call.context, &call.options)
            .await;
        match result {
            Ok((text, raw)) => {
                let reply = Message::assistant(text.clone()).with_params_version(call.version);
                let slot = self.place(call.reask, reply)?;
                if call.reask {
                    self.record_raw(slot.turn, json!(REASK_MARKER));
                }
                self.record_raw(slot.turn, raw.clone());

                let log_path = self
                    .logger
                    .log_model_call(&self.model_call(&call, false, Some(raw), None))
                    .await;
                if let Some(message) = self.timeline.get_mut(slot) {
                    message.log_path = log_path;
                }
                Ok(text)
            }
            Err(err) => {
                self.timeline.truncate(checkpoint);
                Err(self.failed(&call, false, None, &err).await)
            }
        }
    }

    /// Run `request` as a stream of text increments.
    ///
    /// Usage errors are returned right away. The timeline changes once the
    /// stream is first polled: the prompt and an empty reply are appended, and
    /// the reply grows with every increment. Content received before a failure
    /// stays in the timeline.
    pub fn stream_request(
        &mut self,
        request: Request,
        overrides: Params,
    ) -> AgentResult<ReplyStream<'_>> {
        self.check(&request)?;

        Ok(Box::pin(async_stream::try_stream! {
            let call = self.prepare(&request, &overrides);
            tracing::debug!(agent = %self.name, model = %self.model, version = call.version, "streaming");

            let placeholder = Message::assistant("").with_params_version(call.version);
            let slot = self.place(call.reask, placeholder)?;
            if call.reask {
                self.record_raw(slot.turn, json!(REASK_MARKER));
            }

            let opened = self
                .provider
                .stream(&self.model, &call.context, &call.options)
                .await;
            let mut chunks = match opened {
                Ok(chunks) => chunks,
                Err(err) => Err(self.failed(&call, true, None, &err).await)?,
            };

            let mut raw_chunks = Vec::new();
            while let Some(item) = chunks.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let partial = json!({ "chunks": raw_chunks });
                        Err(self.failed(&call, true, Some(partial), &err).await)?
                    }
                };
                let text = match chunk.text {
                    Some(text) => text,
                    None => {
                        tracing::warn!(agent = %self.name, chunk = raw_chunks.len(), "chunk carried no text");
                        String::new()
                    }
                };
                raw_chunks.push(chunk.raw.clone());
                self.record_raw(slot.turn, chunk.raw);
                if let Some(message) = self.timeline.get_mut(slot) {
                    message.content.push_str(&text);
                }
                yield text;
            }

            let response = json!({ "chunks": raw_chunks });
            let log_path = self
                .logger
                .log_model_call(&self.model_call(&call, true, Some(response), None))
                .await;
            if let Some(message) = self.timeline.get_mut(slot) {
                message.log_path = log_path;
            }
        }))
    }

    /// Append the request's own messages and fix the context and parameters it runs with
    fn prepare(&mut self, request: &Request, overrides: &Params) -> PreparedCall {
        let reask = match request {
            Request::Ask { prompt, prefill } => {
                self.timeline.push(Message::user(prompt.as_str()));
                if let Some(prefill) = prefill {
                    self.timeline.push(Message::assistant(prefill.as_str()));
                }
                false
            }
            Request::Alternate => true,
        };

        let options = merge_params(&self.params, overrides);
        let version = self.store.store(&options);
        let upto = if reask {
            self.timeline.len().saturating_sub(1)
        } else {
            self.timeline.len()
        };

        PreparedCall {
            version,
            context: self.timeline.context(upto),
            options,
            reask,
        }
    }

    fn place(&mut self, reask: bool, message: Message) -> AgentResult<Slot> {
        if reask {
            self.timeline.push_alternate(message)
        } else {
            Ok(self.timeline.push(message))
        }
    }

    fn record_raw(&mut self, turn: usize, raw: Value) {
        self.raw_responses.entry(turn).or_default().push(raw);
    }

    fn model_call(
        &self,
        call: &PreparedCall,
        stream: bool,
        response: Option<Value>,
        error: Option<String>,
    ) -> ModelCall {
        ModelCall {
            base_url: self.provider.base_url(),
            model: self.model.clone(),
            messages: call.context.clone(),
            options: call.options.clone(),
            stream,
            response,
            error,
        }
    }

    async fn failed(
        &self,
        call: &PreparedCall,
        stream: bool,
        partial: Option<Value>,
        err: &anyhow::Error,
    ) -> AgentError {
        let error = AgentError::generation(err);
        tracing::error!(agent = %self.name, model = %self.model, error = %error, "generation failed");
        self.logger
            .log_model_call(&self.model_call(call, stream, partial, Some(format!("{:#}", err))))
            .await;
        error
    }
}
