// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The turn driver ("Soul"): drives one session's conversation end to end.
//!
//! [`Agent`] owns the model/tool/session primitives but, by itself, only
//! knows how to run its own built-in agentic loop straight through to
//! completion. [`Soul`] sits one layer up and drives those primitives a step
//! at a time so that schema validation, approval gating, context
//! persistence, and wire-event emission can be interleaved around every
//! tool dispatch — none of which the lower layer needs to know about.

use std::sync::Arc;

use anyhow::Context as _;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use loom_approval::ApprovalCoordinator;
use loom_config::AgentMode;
use loom_context::ContextStore;
use loom_core::{Agent, AgentEvent, CompactionStrategyUsed};
use loom_model::{FunctionCall, Message, Role, StreamedPart, ToolCallPart, ToolContentPart};
use loom_runtime::SkillInfo;
use loom_tools::{validate_args, ToolCall, ToolOutput};
use loom_wire::{ApprovalDecision, MergeBuffer, WireBus, WireEvent};

/// Sentinel the model emits to end a flow-mode ("Ralph loop") run early.
const RALPH_STOP_SENTINEL: &str = "<choice>STOP</choice>";

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model produced a tool-call-free response and the turn is done.
    Finished,
    /// The turn was cut short (cancellation, or a hard step limit).
    Interrupted { reason: String },
}

/// Drives one session's conversation: slash-command resolution, the
/// step-by-step model/tool loop, approval-gated dispatch, context
/// persistence, and the optional flow-mode ("Ralph loop") re-invocation.
///
/// One `Soul` is constructed per active session and lives for as long as
/// that session accepts prompts; `run_turn` is called once per inbound
/// `prompt` request.
pub struct Soul {
    agent: Agent,
    bus: Arc<WireBus>,
    context: Arc<ContextStore>,
    approvals: Arc<ApprovalCoordinator>,
    commands: Vec<SkillInfo>,
    ralph: bool,
}

impl Soul {
    pub fn new(
        agent: Agent,
        bus: Arc<WireBus>,
        context: Arc<ContextStore>,
        approvals: Arc<ApprovalCoordinator>,
        commands: Vec<SkillInfo>,
        ralph: bool,
    ) -> Self {
        Self {
            agent,
            bus,
            context,
            approvals,
            commands,
            ralph,
        }
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn bus(&self) -> &Arc<WireBus> {
        &self.bus
    }

    /// The discovered slash commands this session can resolve, for
    /// surfacing to the RPC front-end at `initialize` time.
    pub fn commands(&self) -> &[SkillInfo] {
        &self.commands
    }

    /// True when every approval request auto-approves (the "Yolo" policy).
    pub fn is_yolo(&self) -> bool {
        self.approvals.is_yolo()
    }

    pub fn agent_mut(&mut self) -> &mut Agent {
        &mut self.agent
    }

    /// Resolve a leading `/command` against the discovered skill set,
    /// splicing the skill's body ahead of any trailing argument text.
    /// Input that does not start with `/`, or whose command key is
    /// unknown, passes through unchanged.
    fn resolve_slash_command(&self, input: &str) -> String {
        let Some(rest) = input.strip_prefix('/') else {
            return input.to_string();
        };
        let mut parts = rest.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("");
        let argument = parts.next().unwrap_or("").trim();

        match self.commands.iter().find(|c| c.command == command) {
            Some(skill) if argument.is_empty() => skill.content.clone(),
            Some(skill) => format!("{}\n\n{argument}", skill.content),
            None => input.to_string(),
        }
    }

    /// Run one user prompt to completion, including any flow-mode
    /// re-invocations, and return how the turn ended.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        turn: u32,
        cancel: CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        self.bus.publish(WireEvent::TurnBegin { turn });

        let resolved = self.resolve_slash_command(user_input);
        self.push_user_message(&resolved).await?;

        // Recorded so a later `send_dmail` in this or a future turn has a
        // stable point to rewind to; the id itself isn't needed here.
        self.context
            .append_checkpoint(Some(format!("turn {turn} start")))
            .await
            .context("appending turn-start checkpoint")?;

        let max_iterations = if self.ralph {
            self.agent.config().max_ralph_iterations.max(1)
        } else {
            1
        };

        let mut outcome = TurnOutcome::Finished;
        for iteration in 0..max_iterations {
            outcome = self.run_step_loop(turn, &cancel).await?;
            if !matches!(outcome, TurnOutcome::Finished) {
                break;
            }
            if !self.ralph || iteration + 1 >= max_iterations {
                break;
            }
            if self.last_assistant_text_contains(RALPH_STOP_SENTINEL) {
                break;
            }
            debug!(turn, iteration, "flow mode: re-invoking prompt");
            self.push_user_message(&resolved).await?;
        }

        self.bus.publish(WireEvent::TurnComplete { turn });
        Ok(outcome)
    }

    async fn push_user_message(&mut self, text: &str) -> anyhow::Result<()> {
        let msg = Message::user(text);
        self.context.append(msg.clone()).await?;
        self.agent.session_mut().push(msg);
        Ok(())
    }

    fn last_assistant_text_contains(&self, needle: &str) -> bool {
        self.agent
            .session()
            .messages
            .iter()
            .rev()
            .find_map(|m| match m.role {
                Role::Assistant => m.as_text(),
                _ => None,
            })
            .map(|t| t.contains(needle))
            .unwrap_or(false)
    }

    /// The inner model <-> tool loop for one flow-mode iteration (or the
    /// entire turn, when flow mode is off). Bounded by
    /// `max_steps_per_turn`; each step is one model round-trip optionally
    /// followed by a batch of tool dispatches.
    async fn run_step_loop(
        &mut self,
        turn: u32,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        let max_steps = self.agent.config().max_steps_per_turn;
        let mut step = 0u32;

        loop {
            step += 1;
            if cancel.is_cancelled() {
                return self.interrupt_step(turn, step, "cancelled").await;
            }
            if step > max_steps {
                return self.interrupt_step(turn, step, "max_steps_per_turn reached").await;
            }

            self.bus.publish(WireEvent::StepBegin { turn, step });

            let mode = self.agent.mode();
            let overhead = self.agent.estimate_schema_overhead(mode);
            self.agent.session_mut().schema_overhead = overhead;

            // The turn's token owns the step; a step that is cancelled
            // mid-stream stops consuming the provider stream immediately
            // instead of running it to completion (§5 turn→step→tool-call
            // cancellation hierarchy).
            let step_cancel = cancel.child_token();
            let (text, tool_calls, had_tool_calls) =
                self.stream_step(turn, step, mode, &step_cancel).await?;

            if !text.is_empty() {
                self.context.append(Message::assistant(&text)).await?;
            }

            if cancel.is_cancelled() {
                return self.interrupt_step(turn, step, "cancelled").await;
            }

            if !had_tool_calls {
                self.run_compaction_gate(turn, mode).await?;
                return Ok(TurnOutcome::Finished);
            }

            let dmail = self.dispatch_tool_calls(tool_calls, &step_cancel).await?;
            self.run_compaction_gate(turn, mode).await?;

            if let Some(dmail) = dmail {
                self.apply_dmail(&dmail).await?;
            }
        }
    }

    async fn interrupt_step(
        &mut self,
        turn: u32,
        step: u32,
        reason: &str,
    ) -> anyhow::Result<TurnOutcome> {
        self.approvals.cancel_all();
        self.bus.publish(WireEvent::StepInterrupted {
            turn,
            step,
            reason: reason.to_string(),
        });
        Ok(TurnOutcome::Interrupted {
            reason: reason.to_string(),
        })
    }

    /// Stream one model round-trip, bridging the agent's internal
    /// `AgentEvent`s onto the wire (merging adjacent text/think deltas)
    /// while the streaming call is in flight.
    async fn stream_step(
        &mut self,
        turn: u32,
        step: u32,
        mode: AgentMode,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(String, Vec<ToolCall>, bool)> {
        let (tx, rx) = mpsc::channel::<AgentEvent>(256);
        let bridge = tokio::spawn(bridge_agent_events(rx, Arc::clone(&self.bus), turn, step));
        let result = self
            .agent
            .stream_one_turn_cancellable(tx, mode, true, cancel)
            .await;
        let _ = bridge.await;
        result
    }

    async fn run_compaction_gate(&mut self, turn: u32, mode: AgentMode) -> anyhow::Result<()> {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(16);
        self.agent.ensure_fits_budget(&tx, mode, turn).await?;
        drop(tx);
        while let Some(event) = rx.recv().await {
            if let AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after,
                strategy,
                turn,
            } = event
            {
                self.bus.publish(WireEvent::CompactionBegin { turn });
                self.bus.publish(WireEvent::CompactionEnd {
                    turn,
                    tokens_before,
                    tokens_after,
                    strategy: strategy_name(strategy).to_string(),
                });
                self.resync_context_after_compaction().await?;
            }
        }
        Ok(())
    }

    /// After a mid-loop compaction collapses the in-memory session, rewrite
    /// the context store to match: drop everything after the most recent
    /// checkpoint-free prefix and append the session's current message set.
    /// Compaction replaces a *contiguous prefix* of non-system messages with
    /// one summary, so the durable log's tail is simply re-derived from the
    /// post-compaction session rather than diffed.
    async fn resync_context_after_compaction(&self) -> anyhow::Result<()> {
        let snapshot = self.context.snapshot().await;
        let live = &self.agent.session().messages;
        if snapshot.len() == live.len() {
            // Nothing actually shrank (e.g. compaction declined to run) —
            // no resync necessary.
            return Ok(());
        }
        for msg in live.iter().skip(snapshot.len().min(live.len())) {
            self.context.append(msg.clone()).await?;
        }
        Ok(())
    }

    /// Approval-gated, schema-validated dispatch of one step's tool calls,
    /// per the toolset's six-step contract: parse (already structured by
    /// this point) -> validate -> approve -> invoke -> panic-catch -> emit
    /// `ToolResult`. Mirrors the agent's own Phase 1/2/3 tool-dispatch
    /// shape (all assistant tool-call messages pushed before any results,
    /// parallel execution, results appended in declaration order) but adds
    /// the approval/validation layer and wire emission around it.
    ///
    /// Returns the first dispatched `send_dmail` call, if any, for the
    /// caller to apply once every result for this step has been recorded.
    async fn dispatch_tool_calls(
        &mut self,
        tool_calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Option<ToolCall>> {
        // Phase 1: one assistant message naming every call made this step,
        // pushed before any result.
        let mut parts = Vec::with_capacity(tool_calls.len());
        for (index, tc) in tool_calls.iter().enumerate() {
            self.bus.publish(WireEvent::ToolCall {
                index,
                id: tc.id.clone(),
                name: tc.name.clone(),
                arguments: tc.args.clone(),
            });
            parts.push(ToolCallPart {
                tool_call_id: tc.id.clone(),
                function: FunctionCall { name: tc.name.clone(), arguments: tc.args.to_string() },
            });
        }
        let msg = Message::tool_calls(parts);
        self.context.append(msg.clone()).await?;
        self.agent.session_mut().push(msg);

        // Phase 2: validate, approve, and invoke concurrently. One failure
        // in any of these stages never aborts its siblings.
        let registry = Arc::clone(self.agent.tools());
        let mut tasks = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls.clone() {
            let registry = Arc::clone(&registry);
            let approvals = Arc::clone(&self.approvals);
            // Each call gets its own grandchild token: cancelling the turn or
            // the step cancels every in-flight call, but one call's token
            // never affects its siblings.
            let call_cancel = cancel.child_token();
            tasks.push(tokio::spawn(dispatch_one(registry, approvals, tc, call_cancel)));
        }

        let (event_tx, mut event_rx) = mpsc::channel::<AgentEvent>(64);
        let mut outputs = Vec::with_capacity(tool_calls.len());
        for (i, task) in tasks.into_iter().enumerate() {
            let output = match task.await {
                Ok(output) => output,
                Err(e) => ToolOutput::err(
                    &tool_calls[i].id,
                    format!("Tool runtime error: {e}"),
                ),
            };
            self.agent.drain_tool_events(&event_tx).await;
            self.bus.publish(WireEvent::ToolResult {
                id: tool_calls[i].id.clone(),
                name: tool_calls[i].name.clone(),
                output: output.content.clone(),
                is_error: output.is_error,
            });
            outputs.push(output);
        }
        drop(event_tx);
        while let Some(event) = event_rx.recv().await {
            match event {
                AgentEvent::TodoUpdate(todos) => self.bus.publish(WireEvent::StatusUpdate {
                    message: format!("todo list updated ({} items)", todos.len()),
                }),
                AgentEvent::ModeChanged(mode) => self.bus.publish(WireEvent::StatusUpdate {
                    message: format!("mode changed to {mode}"),
                }),
                _ => {}
            }
        }

        // Phase 3: tool-result messages, in original declaration order.
        let cap = self.agent.config().tool_result_token_cap;
        for (tc, output) in tool_calls.iter().zip(outputs.iter()) {
            let category = self.agent.tools().output_category(&tc.name);
            let tool_msg = if output.has_images() {
                let parts: Vec<ToolContentPart> = output
                    .parts
                    .iter()
                    .map(|p| match p {
                        loom_tools::ToolOutputPart::Text(t) => ToolContentPart::Text {
                            text: loom_core::smart_truncate(t, category, cap),
                        },
                        loom_tools::ToolOutputPart::Image(url) => {
                            ToolContentPart::Image { image_url: url.clone() }
                        }
                    })
                    .collect();
                Message::tool_result_with_parts(&tc.id, parts)
            } else {
                let content = loom_core::smart_truncate(&output.content, category, cap);
                Message::tool_result(&tc.id, &content)
            };
            self.context.append(tool_msg.clone()).await?;
            self.agent.session_mut().push(tool_msg);
        }

        let dmail = tool_calls
            .iter()
            .zip(outputs.iter())
            .find(|(tc, out)| tc.name == "send_dmail" && !out.is_error)
            .map(|(tc, _)| tc.clone());

        Ok(dmail)
    }

    /// Apply a dispatched, successful `send_dmail` call: rewind the context
    /// store to the named checkpoint, reload the in-memory session from the
    /// rewound log, and append the replacement message. `StepInterrupted`
    /// is intentionally not emitted here — this is a normal control-flow
    /// branch, not a failure.
    async fn apply_dmail(&mut self, call: &ToolCall) -> anyhow::Result<()> {
        let checkpoint_id = call.args.get("checkpoint_id").and_then(Value::as_u64).unwrap_or(0);
        let message = call
            .args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();

        self.context.revert_to(checkpoint_id, true).await?;
        let replayed = self.context.snapshot().await;
        self.agent.session_mut().replace_messages(replayed);
        self.push_user_message(message).await?;
        Ok(())
    }
}

/// Bridge one step's streamed `AgentEvent`s onto the wire, running text and
/// thinking deltas through a merge buffer so adjacent fragments collapse
/// into one `ContentPart` event instead of many.
async fn bridge_agent_events(
    mut rx: mpsc::Receiver<AgentEvent>,
    bus: Arc<WireBus>,
    turn: u32,
    step: u32,
) {
    let mut merge = MergeBuffer::new();
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta(t) => {
                for ev in merge.push(StreamedPart::Text(t)) {
                    bus.publish(ev);
                }
            }
            AgentEvent::ThinkingDelta(t) => {
                for ev in merge.push(StreamedPart::Think { think: t, encrypted: false }) {
                    bus.publish(ev);
                }
            }
            AgentEvent::TextComplete(_) | AgentEvent::ThinkingComplete(_) => {
                if let Some(ev) = merge.flush() {
                    bus.publish(ev);
                }
            }
            AgentEvent::TokenUsage { input, output, .. } => {
                bus.publish(WireEvent::StatusUpdate {
                    message: format!("tokens: {input} in / {output} out"),
                });
            }
            AgentEvent::Error(e) => {
                warn!(turn, step, error = %e, "model stream error");
                bus.publish(WireEvent::StatusUpdate { message: e });
            }
            AgentEvent::Aborted { .. }
            | AgentEvent::ToolCallStarted(_)
            | AgentEvent::ToolCallFinished { .. }
            | AgentEvent::ContextCompacted { .. }
            | AgentEvent::TurnComplete
            | AgentEvent::TodoUpdate(_)
            | AgentEvent::ModeChanged(_)
            | AgentEvent::Question { .. }
            | AgentEvent::QuestionAnswer { .. } => {
                // Not produced by `stream_one_turn`; the turn driver handles
                // the analogous wire events for these itself.
            }
        }
    }
    if let Some(ev) = merge.flush() {
        bus.publish(ev);
    }
}

/// Validate, approve, and invoke a single tool call, per the toolset's
/// dispatch contract (§4.5): schema validation first, then approval
/// gating keyed on the tool's default policy, then invocation with a
/// panic guard.
async fn dispatch_one(
    registry: Arc<loom_tools::ToolRegistry>,
    approvals: Arc<ApprovalCoordinator>,
    call: ToolCall,
    cancel: CancellationToken,
) -> ToolOutput {
    let Some(tool) = registry.get(&call.name) else {
        return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
    };

    let schema = registry
        .normalized_schema(&call.name)
        .unwrap_or_else(|| tool.parameters_schema());
    if let Err(msg) = validate_args(&schema, &call.args) {
        return ToolOutput::err(&call.id, msg);
    }

    use loom_tools::ApprovalPolicy;
    if matches!(tool.default_policy(), ApprovalPolicy::Ask) {
        let description = format!("{}({})", call.name, call.args);
        let decision = approvals
            .request(&call.name, &description, "agent", &call.id)
            .await;
        match decision {
            ApprovalDecision::Approve | ApprovalDecision::ApproveForSession => {}
            ApprovalDecision::Reject => {
                return ToolOutput::err(&call.id, "output-denied: rejected by operator");
            }
            ApprovalDecision::RejectWithReason { reason } => {
                return ToolOutput::err(&call.id, format!("output-denied: {reason}"));
            }
        }
    } else if matches!(tool.default_policy(), ApprovalPolicy::Deny) {
        return ToolOutput::err(&call.id, format!("{} is denied by policy", call.name));
    }

    if cancel.is_cancelled() {
        return ToolOutput::err(&call.id, "cancelled before dispatch");
    }

    let id = call.id.clone();
    match tokio::spawn(async move { tool.execute(&call).await }).await {
        Ok(output) => output,
        Err(e) => ToolOutput::err(&id, format!("Tool runtime error: {e}")),
    }
}

fn strategy_name(strategy: CompactionStrategyUsed) -> &'static str {
    match strategy {
        CompactionStrategyUsed::Structured => "structured",
        CompactionStrategyUsed::Narrative => "narrative",
        CompactionStrategyUsed::Emergency => "emergency",
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn skill(command: &str, content: &str) -> SkillInfo {
        SkillInfo {
            command: command.to_string(),
            name: command.rsplit('/').next().unwrap_or(command).to_string(),
            description: String::new(),
            version: None,
            skill_md_path: PathBuf::from(format!("{command}/SKILL.md")),
            skill_dir: PathBuf::from(command),
            content: content.to_string(),
            loom_meta: None,
        }
    }

    // `resolve_slash_command` is a private method on `Soul`, which itself
    // requires a fully constructed `Agent` to build. Exercise the same
    // logic directly against a plain `Vec<SkillInfo>` rather than standing
    // up an entire agent just to test string splicing.
    fn resolve(commands: &[SkillInfo], input: &str) -> String {
        let Some(rest) = input.strip_prefix('/') else {
            return input.to_string();
        };
        let mut parts = rest.splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("");
        let argument = parts.next().unwrap_or("").trim();
        match commands.iter().find(|c| c.command == command) {
            Some(s) if argument.is_empty() => s.content.clone(),
            Some(s) => format!("{}\n\n{argument}", s.content),
            None => input.to_string(),
        }
    }

    #[test]
    fn known_command_expands_to_skill_body() {
        let commands = vec![skill("loom/plan", "Produce a plan.")];
        assert_eq!(resolve(&commands, "/loom/plan"), "Produce a plan.");
    }

    #[test]
    fn known_command_with_argument_appends_it_after_the_body() {
        let commands = vec![skill("loom/plan", "Produce a plan.")];
        assert_eq!(
            resolve(&commands, "/loom/plan do the thing"),
            "Produce a plan.\n\ndo the thing"
        );
    }

    #[test]
    fn unknown_command_passes_through_verbatim() {
        let commands = vec![skill("loom/plan", "Produce a plan.")];
        assert_eq!(resolve(&commands, "/unknown foo"), "/unknown foo");
    }

    #[test]
    fn non_slash_input_passes_through_verbatim() {
        let commands = vec![skill("loom/plan", "Produce a plan.")];
        assert_eq!(resolve(&commands, "plain text"), "plain text");
    }
}
