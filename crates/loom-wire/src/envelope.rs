// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use loom_model::StreamedPart;

/// Decision carried by an `ApprovalResponse` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    /// Approve this call and every future call with the same fingerprint for
    /// the remainder of the session.
    ApproveForSession,
    Reject,
    RejectWithReason { reason: String },
}

/// One event on the wire.  Tagged by `type` so a JSONL recording is
/// self-describing without a side-channel schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    TurnBegin { turn: u32 },
    TurnComplete { turn: u32 },
    StepBegin { turn: u32, step: u32 },
    StepInterrupted { turn: u32, step: u32, reason: String },
    /// A coalesced chunk of streamed model output. Producers run these
    /// through the merge buffer before emitting, so adjacent text/think
    /// deltas of the same kind arrive as one part, not N.
    ContentPart { part: StreamedPart },
    /// A fully-formed tool call the model has requested.
    ToolCall {
        index: usize,
        id: String,
        name: String,
        arguments: serde_json::Value,
    },
    /// A streamed fragment of a parallel tool call's arguments, forwarded
    /// for consumers that want to show incremental progress before the
    /// call is complete.
    ToolCallPart {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    CompactionBegin { turn: u32 },
    CompactionEnd {
        turn: u32,
        tokens_before: usize,
        tokens_after: usize,
        strategy: String,
    },
    StatusUpdate { message: String },
    /// Event produced by a nested sub-agent; wrapped so consumers can
    /// attribute it to the `task` tool call that spawned it.
    SubagentEvent {
        parent_tool_call_id: String,
        event: Box<WireEvent>,
    },
    /// Outbound request: the turn driver is asking a subscriber (typically
    /// a human operator via the RPC front-end) to approve a tool call.
    ApprovalRequest {
        request_id: String,
        tool_call_id: String,
        tool_name: String,
        description: String,
    },
    /// Inbound reply to an `ApprovalRequest`, also recorded on the wire so a
    /// resumed session log shows what happened without external state.
    ApprovalResponse {
        request_id: String,
        decision: ApprovalDecision,
    },
}

impl WireEvent {
    /// Normalise a legacy envelope alias produced by older front-ends.
    /// `ApprovalRequestResolved` was renamed to `ApprovalResponse`; callers
    /// that deserialize raw JSON before it reaches [`WireEvent`] should route
    /// through this so historical wire logs still replay correctly.
    pub fn canonical_type_name(raw: &str) -> &str {
        match raw {
            "approval_request_resolved" => "approval_response",
            other => other,
        }
    }
}

/// Envelope wrapping a [`WireEvent`] with routing/ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    /// Monotonic per-session sequence number assigned by the bus at publish
    /// time. Durable consumers (the JSONL recorder) use this to detect gaps.
    pub seq: u64,
    #[serde(flatten)]
    pub event: WireEvent,
}
