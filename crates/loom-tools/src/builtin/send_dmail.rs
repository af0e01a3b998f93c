// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Rewind the conversation to an earlier checkpoint and resume from there
/// with a new message, as if the intervening turns never happened.
///
/// This tool only validates the call and reports the requested rewind back
/// to its caller; it holds no reference to the conversation log itself.
/// The turn driver is the one thing that owns both the checkpoint store and
/// the in-memory session, so it is the one thing that can safely perform
/// the rewind — after dispatch it inspects the original call arguments on
/// any `send_dmail` call and applies the rewind before resuming the loop.
pub struct SendDmailTool;

#[async_trait]
impl Tool for SendDmailTool {
    fn name(&self) -> &str {
        "send_dmail"
    }

    fn description(&self) -> &str {
        "Rewind the conversation to an earlier checkpoint (see the checkpoint ids recorded by \
         /compact and other checkpointing commands) and resume from there with a replacement \
         message, discarding everything in between. Use only when a prior line of reasoning has \
         gone irrecoverably wrong and restarting from a known-good point is better than \
         continuing to patch it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "checkpoint_id": {
                    "type": "integer",
                    "description": "Id of the checkpoint to rewind to"
                },
                "message": {
                    "type": "string",
                    "description": "Replacement message to resume the conversation with"
                }
            },
            "required": ["checkpoint_id", "message"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let checkpoint_id = match call.args.get("checkpoint_id").and_then(|v| v.as_u64()) {
            Some(c) => c,
            None => return ToolOutput::err(&call.id, "missing required parameter 'checkpoint_id'"),
        };
        if call.args.get("message").and_then(|v| v.as_str()).is_none() {
            return ToolOutput::err(&call.id, "missing required parameter 'message'");
        }

        debug!(checkpoint_id, "send_dmail tool");
        ToolOutput::ok(
            &call.id,
            format!("rewinding to checkpoint {checkpoint_id}"),
        )
    }
}
