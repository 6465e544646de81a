//! Test doubles for the Troupe collaborator traits.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use troupe_core::error::{Result, TroupeError};
use troupe_core::traits::{EventSink, LlmCaller, ToolContext, ToolExecutor};
use troupe_core::types::*;

/// Install a test-friendly tracing subscriber. Safe to call repeatedly.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Write `contents` to `troupe.toml` in a fresh temp dir.
///
/// Keep the returned `TempDir` alive for as long as the path is used.
pub fn config_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("troupe.toml");
    std::fs::write(&path, contents).expect("write config file");
    (dir, path)
}

enum Scripted {
    Respond(LlmResponse),
    Delayed(Duration, LlmResponse),
    Fail(String),
}

/// LLM double with a queue of canned replies per agent.
///
/// Every invocation records the messages it received. An agent whose queue
/// is empty gets an `LlmRequest` error.
#[derive(Default)]
pub struct ScriptedLlm {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    received: Mutex<HashMap<String, Vec<Vec<ChatMessage>>>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(self, agent: &str, step: Scripted) -> Self {
        self.queues
            .lock()
            .entry(agent.to_string())
            .or_default()
            .push_back(step);
        self
    }

    pub fn respond(self, agent: &str, response: LlmResponse) -> Self {
        self.enqueue(agent, Scripted::Respond(response))
    }

    pub fn respond_after(self, agent: &str, delay: Duration, response: LlmResponse) -> Self {
        self.enqueue(agent, Scripted::Delayed(delay, response))
    }

    pub fn fail(self, agent: &str, message: &str) -> Self {
        self.enqueue(agent, Scripted::Fail(message.to_string()))
    }

    /// Number of invocations for `agent`.
    pub fn calls(&self, agent: &str) -> usize {
        self.received.lock().get(agent).map(Vec::len).unwrap_or(0)
    }

    /// Messages passed to each invocation for `agent`, in call order.
    pub fn received(&self, agent: &str) -> Vec<Vec<ChatMessage>> {
        self.received.lock().get(agent).cloned().unwrap_or_default()
    }

    /// Replies still queued for `agent`.
    pub fn remaining(&self, agent: &str) -> usize {
        self.queues.lock().get(agent).map(VecDeque::len).unwrap_or(0)
    }
}

impl LlmCaller for ScriptedLlm {
    fn invoke(
        &self,
        agent: &AgentProfile,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let name = agent.name.clone();
        self.received
            .lock()
            .entry(name.clone())
            .or_default()
            .push(messages);
        let step = self.queues.lock().get_mut(&name).and_then(VecDeque::pop_front);

        Box::pin(async move {
            match step {
                Some(Scripted::Respond(response)) => Ok(response),
                Some(Scripted::Delayed(delay, response)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Ok(response),
                        _ = cancel.cancelled() => Err(TroupeError::Cancelled),
                    }
                }
                Some(Scripted::Fail(message)) => Err(TroupeError::LlmRequest(message)),
                None => Err(TroupeError::LlmRequest(format!(
                    "no scripted response left for '{}'",
                    name
                ))),
            }
        })
    }
}

/// LLM double that answers `<agent>: <last user message>`.
#[derive(Default)]
pub struct EchoLlm {
    delay: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl EchoLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` before each reply.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of invocations observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl LlmCaller for EchoLlm {
    fn invoke(
        &self,
        agent: &AgentProfile,
        messages: Vec<ChatMessage>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<LlmResponse>> {
        let name = agent.name.clone();
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let result = match self.delay {
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Ok(()),
                        _ = cancel.cancelled() => Err(TroupeError::Cancelled),
                    }
                }
                None => Ok(()),
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result?;

            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(ChatMessage::text)
                .unwrap_or_default();
            Ok(LlmResponse::text(format!("{}: {}", name, last_user)))
        })
    }
}

/// Event sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().clone()
    }

    /// Wire names of the recorded events, in emission order.
    pub fn names(&self) -> Vec<String> {
        self.events.lock().iter().map(AgentEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: AgentEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Clone)]
enum StaticReply {
    Output(String),
    ErrorResult(String),
    Failure(String),
}

/// Tool executor with fixed replies per tool name.
#[derive(Default)]
pub struct StaticTools {
    replies: HashMap<String, StaticReply>,
    calls: Mutex<Vec<(String, serde_json::Value)>>,
}

impl StaticTools {
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` succeeds with `output`.
    pub fn with_tool(mut self, name: &str, output: &str) -> Self {
        self.replies
            .insert(name.to_string(), StaticReply::Output(output.to_string()));
        self
    }

    /// `name` returns an error result the model gets to see.
    pub fn with_error_result(mut self, name: &str, message: &str) -> Self {
        self.replies
            .insert(name.to_string(), StaticReply::ErrorResult(message.to_string()));
        self
    }

    /// `name` fails outright.
    pub fn with_failure(mut self, name: &str, message: &str) -> Self {
        self.replies
            .insert(name.to_string(), StaticReply::Failure(message.to_string()));
        self
    }

    /// Tool invocations so far, as `(name, args)`.
    pub fn calls(&self) -> Vec<(String, serde_json::Value)> {
        self.calls.lock().clone()
    }
}

impl ToolExecutor for StaticTools {
    fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        _ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        self.calls.lock().push((name.to_string(), args));
        let reply = self.replies.get(name).cloned();
        let name = name.to_string();
        Box::pin(async move {
            match reply {
                Some(StaticReply::Output(out)) => Ok(ToolResult::success(out)),
                Some(StaticReply::ErrorResult(msg)) => Ok(ToolResult::error(msg)),
                Some(StaticReply::Failure(message)) => {
                    Err(TroupeError::ToolExecution { tool: name, message })
                }
                None => Ok(ToolResult::error(format!("Unknown tool: {}", name))),
            }
        })
    }
}
