// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Proxy [`Tool`] implementation for tools registered by the RPC client at
//! `initialize` time. Dispatch round-trips to the client over the wire via
//! an outbound `tool_call` request instead of running locally.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use loom_config::AgentMode;
use loom_rpc::RpcServer;
use loom_tools::{ApprovalPolicy, OutputCategory, Tool, ToolCall, ToolOutput};

/// A tool the client declared in `initialize` params. Every call is
/// forwarded to the client as a `tool_call` request and the reply — a
/// `ToolCallResult{is_error, output, display?, extras?}` shape — is mapped
/// back onto [`ToolOutput`]. `display`/`extras`, if present, are folded into
/// the plain-text output rather than dropped, since `ToolOutput` has no
/// dedicated slot for them.
pub struct ExternalTool {
    name: String,
    description: String,
    schema: Value,
    server: Arc<RpcServer>,
}

impl ExternalTool {
    pub fn new(name: String, description: String, schema: Value, server: Arc<RpcServer>) -> Self {
        Self {
            name,
            description,
            schema,
            server,
        }
    }
}

#[async_trait]
impl Tool for ExternalTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    /// Externally-registered tools are never auto-approved — the host
    /// process that registered them is an unknown quantity to the operator
    /// approving the call, so every invocation is gated the same as a
    /// built-in tool with a dangerous default policy.
    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    /// Available in every mode — the client, not this process, decides
    /// which of its tools make sense for a given mode when it registers them.
    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Research, AgentMode::Plan, AgentMode::Agent]
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let params = json!({
            "id": call.id,
            "name": call.name,
            "args": call.args,
        });
        match self.server.request("tool_call", params).await {
            Ok(Ok(result)) => Self::map_result(&call.id, &result),
            Ok(Err(err)) => {
                ToolOutput::err(&call.id, format!("external tool error: {}", err.message))
            }
            Err(e) => ToolOutput::err(&call.id, format!("external tool call failed: {e}")),
        }
    }
}

impl ExternalTool {
    fn map_result(call_id: &str, result: &Value) -> ToolOutput {
        let is_error = result
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let mut text = result
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(display) = result.get("display").and_then(Value::as_str) {
            text = display.to_string();
        }
        if let Some(extras) = result.get("extras") {
            if !extras.is_null() {
                text.push_str(&format!("\n{extras}"));
            }
        }
        if is_error {
            ToolOutput::err(call_id, text)
        } else {
            ToolOutput::ok(call_id, text)
        }
    }
}
