use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use troupe_core::error::{Result, TroupeError};
use troupe_core::session::Session;
use troupe_core::traits::EventSink;
use troupe_core::types::{AgentEvent, ChatMessage, Role, SessionId};

use super::budget::HandoffBudget;
use super::filter::FilterRegistry;
use crate::agent::{AgentRoster, AgentTurn, RunContext};

/// Session key under which the handoff target finds the agent that called it.
pub const HANDOFF_SOURCE_KEY: &str = "handoff:source";

/// A request to transfer control from `source` to `target`.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    pub source: String,
    pub target: String,
    pub filter: Option<String>,
    /// Session of the calling agent.
    pub session: Session,
    /// Conversation accumulated by the caller.
    pub messages: Vec<ChatMessage>,
    /// Agents already visited, ending with `source`.
    pub chain: Vec<String>,
    pub budget: HandoffBudget,
    pub task: String,
    pub cancel: CancellationToken,
}

/// Outcome of a successful handoff chain.
#[derive(Debug, Clone)]
pub struct HandoffResult {
    /// Final text of the agent that ended the chain.
    pub output: String,
    /// Every agent visited, ending with the one that answered.
    pub chain: Vec<String>,
    /// Session the answering agent ran in.
    pub session: SessionId,
    /// Messages the answering agent was started with, after filtering.
    pub received: Vec<ChatMessage>,
}

impl HandoffResult {
    pub fn agent(&self) -> &str {
        self.chain.last().map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    Requested,
    Validated,
    Executing,
    Completed,
    Rejected,
    TimedOut,
}

impl HandoffState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for HandoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates handoff requests and runs the target agents.
#[derive(Clone)]
pub struct HandoffRouter {
    agents: Arc<AgentRoster>,
    filters: Arc<FilterRegistry>,
    sink: Arc<dyn EventSink>,
    max_turns: usize,
}

impl HandoffRouter {
    pub fn new(
        agents: Arc<AgentRoster>,
        filters: Arc<FilterRegistry>,
        sink: Arc<dyn EventSink>,
        max_turns: usize,
    ) -> Self {
        Self {
            agents,
            filters,
            sink,
            max_turns,
        }
    }

    pub fn agents(&self) -> &Arc<AgentRoster> {
        &self.agents
    }

    pub fn filters(&self) -> &Arc<FilterRegistry> {
        &self.filters
    }

    /// Route one hop, following any further handoffs the target makes.
    pub fn route(&self, req: HandoffRequest) -> BoxFuture<'_, Result<HandoffResult>> {
        Box::pin(async move {
            let hop = req.budget.hops() + 1;
            self.sink.emit(AgentEvent::HandoffRequested {
                source: req.source.clone(),
                target: req.target.clone(),
                depth: hop,
            });
            self.trace(&req, HandoffState::Requested);

            let budget = match self.validate(&req) {
                Ok(budget) => budget,
                Err(e) => {
                    self.reject(&req, &e);
                    return Err(e);
                }
            };
            self.trace(&req, HandoffState::Validated);

            if req.cancel.is_cancelled() {
                return Err(TroupeError::Cancelled);
            }

            let target = self.agents.require(&req.target)?.clone();
            let session = req.session.child(true)?;
            session.set(
                HANDOFF_SOURCE_KEY,
                serde_json::Value::String(req.source.clone()),
            )?;

            let received = self.prepare_messages(&req, target.profile().system_prompt())?;
            let ctx = RunContext {
                task: req.task.clone(),
                session: session.clone(),
                cancel: req.cancel.clone(),
                max_turns: self.max_turns,
            };

            self.trace(&req, HandoffState::Executing);
            let turn = match tokio::time::timeout(
                budget.remaining_time(),
                target.run(received.clone(), &ctx),
            )
            .await
            {
                Ok(turn) => turn?,
                Err(_) => {
                    let e = TroupeError::HandoffTimeout {
                        elapsed: budget.elapsed(),
                    };
                    self.trace(&req, HandoffState::TimedOut);
                    self.reject(&req, &e);
                    return Err(e);
                }
            };

            let mut chain = req.chain.clone();
            chain.push(req.target.clone());

            let result = match turn {
                AgentTurn::Finished { output, .. } => HandoffResult {
                    output,
                    chain,
                    session: session.id().clone(),
                    received,
                },
                AgentTurn::Handoff {
                    target: next,
                    filter,
                    messages,
                } => {
                    let next_req = HandoffRequest {
                        source: req.target.clone(),
                        target: next,
                        filter,
                        session: session.clone(),
                        messages,
                        chain,
                        budget,
                        task: req.task.clone(),
                        cancel: req.cancel.clone(),
                    };
                    self.route(next_req).await?
                }
            };

            self.trace(&req, HandoffState::Completed);
            self.sink.emit(AgentEvent::HandoffCompleted {
                source: req.source.clone(),
                target: req.target.clone(),
            });
            Ok(result)
        })
    }

    /// Checks a request and returns the budget for the hop.
    fn validate(&self, req: &HandoffRequest) -> Result<HandoffBudget> {
        if req.chain.iter().any(|a| a == &req.target) {
            return Err(TroupeError::HandoffCycle {
                chain: req.chain.clone(),
                target: req.target.clone(),
            });
        }

        if !self.agents.contains(&req.target) {
            return Err(TroupeError::UnknownAgent(req.target.clone()));
        }
        let source = self.agents.require(&req.source)?;
        if !source.profile().can_hand_off_to(&req.target) {
            return Err(TroupeError::HandoffNotPermitted {
                source_agent: req.source.clone(),
                target: req.target.clone(),
            });
        }
        if let Some(ref name) = req.filter {
            self.filters.resolve(name)?;
        }

        let budget = req.budget.consume_hop()?;

        if budget.is_expired() {
            return Err(TroupeError::HandoffTimeout {
                elapsed: budget.elapsed(),
            });
        }

        Ok(budget)
    }

    /// Drop the caller's system messages, apply the filter, and start the
    /// conversation with the target's own system prompt.
    fn prepare_messages(
        &self,
        req: &HandoffRequest,
        system_prompt: String,
    ) -> Result<Vec<ChatMessage>> {
        let mut messages: Vec<ChatMessage> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        if let Some(ref name) = req.filter {
            let filter = self.filters.resolve(name)?;
            messages = filter.apply(messages);
            debug!(
                filter = %filter.name(),
                remaining = messages.len(),
                "Applied handoff input filter"
            );
        }

        let mut received = Vec::with_capacity(messages.len() + 1);
        received.push(ChatMessage::system(system_prompt));
        received.extend(messages);
        Ok(received)
    }

    fn reject(&self, req: &HandoffRequest, error: &TroupeError) {
        let reason = error.rejection_reason().unwrap_or("error");
        if !matches!(error, TroupeError::HandoffTimeout { .. }) {
            self.trace(req, HandoffState::Rejected);
        }
        warn!(
            source = %req.source,
            target = %req.target,
            reason,
            error = %error,
            "Handoff rejected"
        );
        self.sink.emit(AgentEvent::HandoffRejected {
            source: req.source.clone(),
            target: req.target.clone(),
            reason: reason.to_string(),
        });
    }

    fn trace(&self, req: &HandoffRequest, state: HandoffState) {
        match state {
            HandoffState::Completed => {
                info!(
                    source = %req.source,
                    target = %req.target,
                    task = %req.task,
                    state = %state,
                    "Handoff finished"
                );
            }
            _ => debug!(
                source = %req.source,
                target = %req.target,
                task = %req.task,
                state = %state,
                "Handoff state"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use troupe_core::session::SessionArena;
    use troupe_core::types::{AgentProfile, LlmResponse, RawToolCall};
    use troupe_test_utils::{RecordingSink, ScriptedLlm};

    use crate::agent::Agent;

    fn handoff_to(target: &str) -> LlmResponse {
        LlmResponse::text("").with_tool_call(RawToolCall::new(
            format!("h-{}", target),
            "handoff",
            json!({ "agent": target }),
        ))
    }

    fn router(
        llm: Arc<ScriptedLlm>,
        profiles: Vec<AgentProfile>,
        sink: Arc<RecordingSink>,
    ) -> HandoffRouter {
        let mut roster = AgentRoster::new();
        for p in profiles {
            roster.register(Agent::new(p, llm.clone()));
        }
        HandoffRouter::new(
            Arc::new(roster),
            Arc::new(FilterRegistry::with_builtins()),
            sink,
            5,
        )
    }

    fn request(source: &str, target: &str, budget: HandoffBudget) -> HandoffRequest {
        let arena = Arc::new(SessionArena::new());
        HandoffRequest {
            source: source.into(),
            target: target.into(),
            filter: None,
            session: Session::root(&arena),
            messages: vec![ChatMessage::system("caller prompt"), ChatMessage::user("help")],
            chain: vec![source.into()],
            budget,
            task: "t".into(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn single_hop_runs_target_in_child_session() {
        let llm = Arc::new(ScriptedLlm::new().respond("b", LlmResponse::text("from b")));
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm.clone(),
            vec![
                AgentProfile::new("a").with_handoffs(vec!["b".into()]),
                AgentProfile::new("b").with_role("the billing desk"),
            ],
            sink.clone(),
        );
        let req = request("a", "b", HandoffBudget::new(3, Duration::from_secs(30)));
        let caller = req.session.clone();

        let result = router.route(req).await.unwrap();
        assert_eq!(result.output, "from b");
        assert_eq!(result.chain, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(result.agent(), "b");

        let target = Session::attach(caller.arena(), result.session.clone()).unwrap();
        assert_eq!(target.parent(), Some(caller.id().clone()));
        assert_eq!(target.get(HANDOFF_SOURCE_KEY), Some(json!("a")));

        // caller's system prompt replaced by the target's
        assert_eq!(result.received[0].text(), "You are the billing desk.");
        assert_eq!(result.received.len(), 2);

        assert_eq!(
            sink.names(),
            vec!["handoff_requested".to_string(), "handoff_completed".to_string()]
        );
    }

    #[tokio::test]
    async fn self_handoff_is_a_cycle() {
        let llm = Arc::new(ScriptedLlm::new());
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm,
            vec![AgentProfile::new("a").with_handoffs(vec!["a".into()])],
            sink.clone(),
        );
        let err = router
            .route(request("a", "a", HandoffBudget::new(3, Duration::from_secs(30))))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::HandoffCycle { .. }));
        assert!(sink.names().contains(&"handoff_rejected:cycle".to_string()));
    }

    #[tokio::test]
    async fn not_permitted_and_unknown_target() {
        let llm = Arc::new(ScriptedLlm::new());
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm.clone(),
            vec![AgentProfile::new("a"), AgentProfile::new("b")],
            sink.clone(),
        );
        let budget = HandoffBudget::new(3, Duration::from_secs(30));

        let err = router.route(request("a", "b", budget)).await.unwrap_err();
        assert!(matches!(err, TroupeError::HandoffNotPermitted { .. }));

        let err = router.route(request("a", "ghost", budget)).await.unwrap_err();
        assert!(matches!(err, TroupeError::UnknownAgent(_)));
        assert_eq!(llm.calls("b"), 0);
    }

    #[tokio::test]
    async fn unknown_filter_rejected() {
        let llm = Arc::new(ScriptedLlm::new());
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm,
            vec![
                AgentProfile::new("a").with_handoffs(vec!["b".into()]),
                AgentProfile::new("b"),
            ],
            sink.clone(),
        );
        let mut req = request("a", "b", HandoffBudget::new(3, Duration::from_secs(30)));
        req.filter = Some("summarize".into());
        let err = router.route(req).await.unwrap_err();
        assert!(matches!(err, TroupeError::UnknownFilter(_)));
        assert!(sink.names().contains(&"handoff_rejected:unknown_filter".to_string()));
    }

    #[tokio::test]
    async fn zero_budget_times_out_without_invoking_target() {
        let llm = Arc::new(ScriptedLlm::new().respond("b", LlmResponse::text("late")));
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm.clone(),
            vec![
                AgentProfile::new("a").with_handoffs(vec!["b".into()]),
                AgentProfile::new("b"),
            ],
            sink.clone(),
        );
        let err = router
            .route(request("a", "b", HandoffBudget::new(3, Duration::ZERO)))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::HandoffTimeout { .. }));
        assert_eq!(llm.calls("b"), 0);
        assert!(sink.names().contains(&"handoff_rejected:timeout".to_string()));
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let llm = Arc::new(
            ScriptedLlm::new().respond_after(
                "b",
                Duration::from_secs(5),
                LlmResponse::text("slow"),
            ),
        );
        let sink = Arc::new(RecordingSink::new());
        let router = router(
            llm,
            vec![
                AgentProfile::new("a").with_handoffs(vec!["b".into()]),
                AgentProfile::new("b"),
            ],
            sink,
        );
        let err = router
            .route(request("a", "b", HandoffBudget::new(3, Duration::from_millis(50))))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::HandoffTimeout { .. }));
    }

    #[tokio::test]
    async fn chained_hops_respect_depth() {
        // a -> b -> c: two hops
        let llm = Arc::new(
            ScriptedLlm::new()
                .respond("b", handoff_to("c"))
                .respond("c", LlmResponse::text("from c")),
        );
        let profiles = vec![
            AgentProfile::new("a").with_handoffs(vec!["b".into()]),
            AgentProfile::new("b").with_handoffs(vec!["c".into()]),
            AgentProfile::new("c"),
        ];
        let sink = Arc::new(RecordingSink::new());
        let ok = router(llm, profiles.clone(), sink.clone())
            .route(request("a", "b", HandoffBudget::new(2, Duration::from_secs(30))))
            .await
            .unwrap();
        assert_eq!(ok.output, "from c");
        assert_eq!(ok.chain, vec!["a", "b", "c"]);

        let llm = Arc::new(
            ScriptedLlm::new()
                .respond("b", handoff_to("c"))
                .respond("c", LlmResponse::text("from c")),
        );
        let err = router(llm.clone(), profiles, sink)
            .route(request("a", "b", HandoffBudget::new(1, Duration::from_secs(30))))
            .await
            .unwrap_err();
        assert!(matches!(err, TroupeError::HandoffDepth { max_depth: 1, hops: 2 }));
        assert_eq!(llm.calls("c"), 0);
    }
}
