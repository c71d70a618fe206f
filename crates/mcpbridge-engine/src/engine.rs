//! The chat session engine: one entry point per user message, shared by
//! every transport adapter. Adapters supply a frame sink and a
//! cancellation token; the engine is unaware of sockets.

use crate::cost::CostModel;
use crate::pipeline::{Admission, AuthPipeline, Identity};
use crate::session::{Conversation, Session};
use crate::sink::FrameSink;
use crate::users::UserDirectory;
use mcpbridge_core::config::{GuardAction, LlmConfig};
use mcpbridge_core::protocol::ToolStatus;
use mcpbridge_core::{
    AuditRecord, AuditSource, BridgeConfig, Error, FlowEventKind, Result, ServerFrame,
    ToolInvocation,
};
use mcpbridge_flow::{AuditStore, FlowRecord, FlowTracker};
use mcpbridge_guard::{BehaviorTracker, GuardMediator};
use mcpbridge_llm::{
    AccumulatedToolCall, ContentBlock, LlmProvider, LlmRequest, StreamDelta,
};
use mcpbridge_mcp::coordinator::split_qualified;
use mcpbridge_mcp::McpCoordinator;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything the engine needs, wired once at startup.
pub struct EngineDeps {
    pub provider: Arc<dyn LlmProvider>,
    pub coordinator: Arc<McpCoordinator>,
    pub tracker: Arc<FlowTracker>,
    pub audit: Arc<dyn AuditStore>,
    pub directory: Arc<dyn UserDirectory>,
    pub guard: Arc<GuardMediator>,
    pub behavior: Arc<BehaviorTracker>,
}

pub struct ChatEngine {
    provider: Arc<dyn LlmProvider>,
    coordinator: Arc<McpCoordinator>,
    tracker: Arc<FlowTracker>,
    audit: Arc<dyn AuditStore>,
    directory: Arc<dyn UserDirectory>,
    guard: Arc<GuardMediator>,
    behavior: Arc<BehaviorTracker>,
    pipeline: AuthPipeline,
    cost: CostModel,
    llm: LlmConfig,
}

impl ChatEngine {
    pub fn new(deps: EngineDeps, config: &BridgeConfig) -> Self {
        let pipeline = AuthPipeline::new(
            deps.directory.clone(),
            deps.audit.clone(),
            deps.coordinator.clone(),
        );
        Self {
            provider: deps.provider,
            coordinator: deps.coordinator,
            tracker: deps.tracker,
            audit: deps.audit,
            directory: deps.directory,
            guard: deps.guard,
            behavior: deps.behavior,
            pipeline,
            cost: CostModel::new(config.llm.price_per_token),
            llm: config.llm.clone(),
        }
    }

    pub fn tracker(&self) -> &Arc<FlowTracker> {
        &self.tracker
    }

    /// Handle one user message end to end. Frames are sent through the
    /// sink as the engine progresses; every terminal path — success,
    /// refusal, disconnect, internal failure — archives the session and
    /// emits exactly one audit record. The returned error has already been
    /// surfaced to the client (except `ClientGone`); it is advisory for
    /// transport close handling.
    pub async fn handle_message(
        &self,
        identity: Option<&Identity>,
        conversation: &mut Conversation,
        text: &str,
        source: AuditSource,
        sink: &mut dyn FrameSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let user_id = identity.map(|i| i.user_id).unwrap_or(0);
        // Monitored is frozen here; mid-session toggles don't apply.
        let monitored = identity
            .map(|i| self.tracker.is_monitored(i.user_id))
            .unwrap_or(false);
        // One-shot streams carry no conversation identity by design.
        let conversation_id =
            (source != AuditSource::ChatSse).then(|| conversation.id.clone());

        let mut session = Session::new(user_id, conversation_id, monitored);
        conversation.last_session = Some(session.id.clone());

        let outcome = self
            .run(identity, conversation, text, &mut session, sink, &cancel)
            .await;

        let result = match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                session
                    .emit(
                        &self.tracker,
                        FlowEventKind::Error,
                        json!({ "code": e.code(), "message": e.to_string() }),
                    )
                    .await;
                if !matches!(e, Error::ClientGone) {
                    // Best-effort: the client may be gone by now.
                    let _ = sink.send(ServerFrame::error(&e)).await;
                }
                Err(e)
            }
        };

        self.finalize(session, source, result.is_ok()).await;
        result
    }

    async fn run(
        &self,
        identity: Option<&Identity>,
        conversation: &mut Conversation,
        text: &str,
        session: &mut Session,
        sink: &mut dyn FrameSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let admission = self
            .pipeline
            .admit(&self.tracker, session, identity)
            .await?;

        sink.send(ServerFrame::Welcome {
            text: admission.welcome.clone(),
            usage: admission.usage.clone(),
            available_mcps: admission.user.allowed_mcps.clone(),
        })
        .await?;

        self.apply_prompt_guard(conversation, text, session, sink, &admission)
            .await?;

        self.llm_loop(conversation, text, session, sink, cancel, &admission)
            .await?;

        let tokens = session.usage.total();
        session
            .emit(
                &self.tracker,
                FlowEventKind::LlmComplete,
                json!({
                    "tokens": tokens,
                    "input_tokens": session.usage.input_tokens,
                    "output_tokens": session.usage.output_tokens,
                }),
            )
            .await;

        let surcharges: f64 = session
            .invocations
            .iter()
            .filter(|i| i.ok)
            .filter_map(|i| {
                admission
                    .surcharges
                    .get(&mcpbridge_mcp::coordinator::qualify(&i.mcp, &i.tool))
            })
            .sum();
        session.cost = self.cost.session_cost(tokens, surcharges);

        sink.send(ServerFrame::done(tokens, session.cost)).await?;
        Ok(())
    }

    /// Classify the message and apply the configured escalation action.
    async fn apply_prompt_guard(
        &self,
        conversation: &Conversation,
        text: &str,
        session: &mut Session,
        sink: &mut dyn FrameSink,
        admission: &Admission,
    ) -> Result<()> {
        if self.guard.bypasses(&admission.user.role) {
            return Ok(());
        }
        let outcome = self.guard.classify(admission.user.user_id, text).await;
        if !outcome.flagged {
            return Ok(());
        }

        let (count, action) = self
            .behavior
            .record_unsafe(admission.user.user_id, Some(&conversation.id));
        let reason = if outcome.verdict.reason.is_empty() {
            "flagged by prompt guard".to_string()
        } else {
            outcome.verdict.reason.clone()
        };
        info!(
            user_id = admission.user.user_id,
            score = outcome.verdict.score,
            count,
            ?action,
            "unsafe prompt verdict"
        );

        match action {
            GuardAction::Warn => {
                sink.send(ServerFrame::token(format!(
                    "[warning] Your message was flagged: {reason}\n"
                )))
                .await?;
                Ok(())
            }
            GuardAction::BlockMessage => {
                session
                    .emit(
                        &self.tracker,
                        FlowEventKind::Error,
                        json!({
                            "stage": "prompt_guard",
                            "action": "block_message",
                            "score": outcome.verdict.score,
                            "reason": &reason,
                            "count": count,
                        }),
                    )
                    .await;
                Err(Error::PromptUnsafe { reason })
            }
            GuardAction::BlockUser => {
                self.directory
                    .set_blocked(
                        admission.user.user_id,
                        &format!("prompt guard escalation: {reason}"),
                    )
                    .await;
                session
                    .emit(
                        &self.tracker,
                        FlowEventKind::Error,
                        json!({
                            "stage": "prompt_guard",
                            "action": "block_user",
                            "score": outcome.verdict.score,
                            "reason": &reason,
                            "count": count,
                        }),
                    )
                    .await;
                Err(Error::PromptUnsafe { reason })
            }
        }
    }

    /// The streaming LLM ⇄ tool loop.
    async fn llm_loop(
        &self,
        conversation: &mut Conversation,
        text: &str,
        session: &mut Session,
        sink: &mut dyn FrameSink,
        cancel: &CancellationToken,
        admission: &Admission,
    ) -> Result<()> {
        conversation.push_user(text);

        let mut iterations = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::ClientGone);
            }
            iterations += 1;
            if iterations > self.llm.tool_iteration_cap {
                return Err(Error::IterationCap {
                    cap: self.llm.tool_iteration_cap,
                });
            }

            session
                .emit(
                    &self.tracker,
                    FlowEventKind::LlmThinking,
                    json!({ "iteration": iterations }),
                )
                .await;

            let request = LlmRequest {
                model: self.llm.default_model.clone(),
                messages: conversation.messages(),
                tools: (!admission.tools.is_empty()).then(|| admission.tools.clone()),
                max_tokens: Some(self.llm.max_tokens),
                system: None,
            };

            let stream = self
                .provider
                .complete_stream(request, cancel.child_token())
                .await
                .map_err(|e| match e {
                    mcpbridge_llm::LlmError::Cancelled => Error::ClientGone,
                    other => Error::Transport(other.to_string()),
                })?;
            tokio::pin!(stream);

            let mut text_content = String::new();
            let mut tool_calls: Vec<AccumulatedToolCall> = Vec::new();
            let mut current_tool: Option<AccumulatedToolCall> = None;

            loop {
                let delta = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::ClientGone),
                    delta = stream.next() => match delta {
                        Some(d) => d,
                        None => break,
                    },
                };
                match delta {
                    Ok(StreamDelta::Text(t)) => {
                        text_content.push_str(&t);
                        // Backpressure: a slow client stalls this send and
                        // with it the stream consumption.
                        sink.send(ServerFrame::token(t)).await?;
                    }
                    Ok(StreamDelta::Thinking(_)) => {}
                    Ok(StreamDelta::ToolCallStart { id, name }) => {
                        current_tool = Some(AccumulatedToolCall {
                            id,
                            name,
                            arguments: String::new(),
                        });
                    }
                    Ok(StreamDelta::ToolCallDelta { arguments, .. }) => {
                        if let Some(tool) = &mut current_tool {
                            tool.arguments.push_str(&arguments);
                        }
                    }
                    Ok(StreamDelta::ToolCallEnd { .. }) => {
                        if let Some(tool) = current_tool.take() {
                            tool_calls.push(tool);
                        }
                    }
                    Ok(StreamDelta::Done { usage, .. }) => {
                        session.usage.add(usage);
                    }
                    Ok(StreamDelta::Error(e)) => return Err(Error::Transport(e)),
                    Err(mcpbridge_llm::LlmError::Cancelled) => return Err(Error::ClientGone),
                    Err(e) => return Err(Error::Transport(e.to_string())),
                }
            }

            if tool_calls.is_empty() {
                conversation.push_assistant(Some(&text_content), Vec::new());
                return Ok(());
            }

            let blocks: Vec<ContentBlock> = tool_calls
                .iter()
                .map(|tc| ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: tc.parse_arguments().unwrap_or_else(|_| json!({})),
                })
                .collect();
            conversation.push_assistant(
                (!text_content.is_empty()).then_some(text_content.as_str()),
                blocks,
            );

            // Directives dispatch serially, in emission order.
            for tc in tool_calls {
                if cancel.is_cancelled() {
                    return Err(Error::ClientGone);
                }
                self.dispatch_tool(conversation, session, sink, &tc, admission)
                    .await?;
            }
        }
    }

    /// Dispatch one tool directive. Dispatch errors stay inside the loop:
    /// the LLM sees a structured error result and may recover.
    async fn dispatch_tool(
        &self,
        conversation: &mut Conversation,
        session: &mut Session,
        sink: &mut dyn FrameSink,
        tc: &AccumulatedToolCall,
        admission: &Admission,
    ) -> Result<()> {
        let args = tc.parse_arguments().unwrap_or_else(|_| json!({}));
        let (mcp, tool) = match split_qualified(&tc.name) {
            Some((m, t)) => (m.to_string(), t.to_string()),
            None => (String::new(), tc.name.clone()),
        };

        session
            .emit(
                &self.tracker,
                FlowEventKind::ToolCall,
                json!({ "mcp": &mcp, "tool": &tool }),
            )
            .await;
        sink.send(ServerFrame::ToolCall {
            mcp: mcp.clone(),
            tool: tool.clone(),
        })
        .await?;

        match self
            .coordinator
            .invoke(&mcp, &tool, &args, &admission.user)
            .await
        {
            Ok(invocation) => {
                session
                    .emit(
                        &self.tracker,
                        FlowEventKind::ToolResult,
                        json!({
                            "mcp": &mcp,
                            "tool": &tool,
                            "ok": true,
                            "cache_hit": invocation.cache_hit,
                            "duration_ms": invocation.duration_ms,
                        }),
                    )
                    .await;
                sink.send(ServerFrame::ToolResult {
                    status: ToolStatus::Ok,
                    duration_ms: invocation.duration_ms,
                })
                .await?;
                let content = serde_json::to_string(&invocation.value)
                    .unwrap_or_else(|_| invocation.value.to_string());
                conversation.push_tool_result(&tc.id, &content, false);
                session.invocations.push(ToolInvocation {
                    mcp,
                    tool,
                    fingerprint: invocation.fingerprint,
                    ok: true,
                    error: None,
                    duration_ms: invocation.duration_ms,
                    cache_hit: invocation.cache_hit,
                });
            }
            Err(e) => {
                let fingerprint = mcpbridge_mcp::fingerprint(&args);
                let core_err: Error = e.into();
                session
                    .emit(
                        &self.tracker,
                        FlowEventKind::Error,
                        json!({
                            "mcp": &mcp,
                            "tool": &tool,
                            "code": core_err.code(),
                            "message": core_err.to_string(),
                        }),
                    )
                    .await;
                sink.send(ServerFrame::ToolResult {
                    status: ToolStatus::Error,
                    duration_ms: 0,
                })
                .await?;
                conversation.push_tool_result(&tc.id, &format!("Error: {core_err}"), true);
                session.invocations.push(ToolInvocation {
                    mcp,
                    tool,
                    fingerprint,
                    ok: false,
                    error: Some(core_err.to_string()),
                    duration_ms: 0,
                    cache_hit: false,
                });
            }
        }
        Ok(())
    }

    /// Audit + archive, attempted on every terminal path.
    async fn finalize(&self, session: Session, source: AuditSource, success: bool) {
        let mut tools_used: Vec<String> = session
            .invocations
            .iter()
            .filter(|i| i.ok)
            .map(|i| format!("{}.{}", i.mcp, i.tool))
            .collect();
        tools_used.sort();
        tools_used.dedup();
        let mut mcps_used: Vec<String> =
            session.invocations.iter().map(|i| i.mcp.clone()).collect();
        mcps_used.sort();
        mcps_used.dedup();

        let audit = AuditRecord {
            user_id: session.user_id,
            conversation_id: session.conversation_id.clone(),
            session_id: session.id.clone(),
            source,
            tokens: session.usage.total(),
            cost: session.cost,
            tools_used,
            mcps_used,
            success,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = self.audit.record(audit).await {
            warn!(session_id = %session.id, "audit record failed: {e}");
        }

        let record = FlowRecord {
            session_id: session.id.clone(),
            conversation_id: session.conversation_id.clone(),
            user_id: session.user_id,
            created_at: session.started_at,
            flow_data: session.into_events(),
        };
        self.tracker.archive(record).await;
    }
}
