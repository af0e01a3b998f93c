// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use loom_config::AgentMode;

use crate::schema::normalize_schema;
use crate::{OutputCategory, Tool, ToolCall, ToolOutput};

/// A tool name collides with one already registered (built-in or
/// externally-registered). Registration is rejected rather than silently
/// shadowing the existing tool — two tools may never share a name.
#[derive(Debug, Clone, thiserror::Error)]
#[error("tool name already registered: {0}")]
pub struct ExternalToolConflict(pub String);

/// A tool schema – mirrors loom_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// The map is guarded by a short-critical-section `std::sync::Mutex` rather
/// than requiring `&mut self` for registration: externally-registered tools
/// (`initialize` RPC params, §4.10) arrive after the registry has already
/// been wrapped in an `Arc` and handed to the running `Agent`, so
/// registration must be possible through a shared reference. No method
/// holds the lock across an `.await`.
struct Entry {
    tool: Arc<dyn Tool>,
    /// Schema normalized once at registration time (§4.5) — `$ref`s inlined,
    /// `title`/`format` stripped, `type` arrays converted to `anyOf` — and
    /// reused for every schema listing and every dispatched call, so a tool
    /// never has to normalize its own schema on the hot path.
    normalized_schema: Value,
}

pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Mutex::new(HashMap::new()) }
    }

    /// Register a tool. Rejects the registration (without touching the
    /// existing entry) if a tool with the same name is already present.
    pub fn register(&self, tool: impl Tool + 'static) -> Result<(), ExternalToolConflict> {
        let mut tools = self.tools.lock().unwrap();
        let name = tool.name().to_string();
        if tools.contains_key(&name) {
            return Err(ExternalToolConflict(name));
        }
        let normalized_schema = normalize_schema(tool.parameters_schema());
        tools.insert(name, Entry { tool: Arc::new(tool), normalized_schema });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.lock().unwrap().get(name).map(|e| e.tool.clone())
    }

    /// The normalized parameter schema stored at registration time — the
    /// schema tool-call argument validation and schema listings must use,
    /// rather than calling `Tool::parameters_schema()` directly.
    pub fn normalized_schema(&self, name: &str) -> Option<Value> {
        self.tools.lock().unwrap().get(name).map(|e| e.normalized_schema.clone())
    }

    /// Produce schemas for ALL registered tools (mode-unfiltered).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.lock().unwrap().values().map(|e| ToolSchema {
            name: e.tool.name().to_string(),
            description: e.tool.description().to_string(),
            parameters: e.normalized_schema.clone(),
        }).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Produce schemas only for tools available in the given mode.
    pub fn schemas_for_mode(&self, mode: AgentMode) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.lock().unwrap().values()
            .filter(|e| e.tool.modes().contains(&mode))
            .map(|e| ToolSchema {
                name: e.tool.name().to_string(),
                description: e.tool.description().to_string(),
                parameters: e.normalized_schema.clone(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let tool = self.tools.lock().unwrap().get(&call.name).map(|e| e.tool.clone());
        match tool {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            ),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.lock().unwrap().keys().cloned().collect()
    }

    /// Output shape of a tool's text content, used by the truncation layer.
    /// Unknown tool names fall back to [`OutputCategory::Generic`].
    pub fn output_category(&self, name: &str) -> OutputCategory {
        self.tools
            .lock()
            .unwrap()
            .get(name)
            .map(|e| e.tool.output_category())
            .unwrap_or_default()
    }

    /// Check whether `name` is free for an externally-registered tool.
    /// Existing tools always win — a later registration may never shadow
    /// one already present.
    pub fn check_external_name(&self, name: &str) -> Result<(), ExternalToolConflict> {
        if self.tools.lock().unwrap().contains_key(name) {
            Err(ExternalToolConflict(name.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn names_for_mode(&self, mode: AgentMode) -> Vec<String> {
        let mut names: Vec<String> = self.tools.lock().unwrap().values()
            .filter(|e| e.tool.modes().contains(&mode))
            .map(|e| e.tool.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::policy::ApprovalPolicy;
    use crate::tool::{Tool, ToolCall, ToolOutput};

    /// Minimal no-op tool for registry tests.
    struct EchoTool { name: &'static str }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str { self.name }
        fn description(&self) -> &str { "echoes its input" }
        fn parameters_schema(&self) -> Value { json!({ "type": "object" }) }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_returns_all_registered() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" }).unwrap();
        reg.register(EchoTool { name: "b" }).unwrap();
        let mut names = reg.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn schemas_contains_registered_tool() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "my_tool" }).unwrap();
        let schemas = reg.schemas();
        assert!(schemas.iter().any(|s| s.name == "my_tool"));
    }

    #[test]
    fn schemas_include_description() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" }).unwrap();
        let schemas = reg.schemas();
        assert_eq!(schemas[0].description, "echoes its input");
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" }).unwrap();
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn registering_same_name_twice_is_rejected() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" }).unwrap();
        let err = reg.register(EchoTool { name: "t" }).unwrap_err();
        assert_eq!(err.0, "t");
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn check_external_name_rejects_existing_name() {
        let reg = ToolRegistry::new();
        reg.register(EchoTool { name: "shell" }).unwrap();
        assert!(reg.check_external_name("shell").is_err());
        assert!(reg.check_external_name("new_tool").is_ok());
    }

    struct TitledTool;

    #[async_trait]
    impl Tool for TitledTool {
        fn name(&self) -> &str { "titled" }
        fn description(&self) -> &str { "has a title in its raw schema" }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "title": "Args", "properties": {"x": {"type": ["integer", "null"]}} })
        }
        fn default_policy(&self) -> ApprovalPolicy { ApprovalPolicy::Auto }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.to_string())
        }
    }

    #[test]
    fn schema_is_normalized_at_registration() {
        let reg = ToolRegistry::new();
        reg.register(TitledTool).unwrap();
        let normalized = reg.normalized_schema("titled").unwrap();
        assert!(normalized.get("title").is_none());
        assert!(normalized["properties"]["x"]["anyOf"].is_array());

        let schema = reg.schemas().into_iter().find(|s| s.name == "titled").unwrap();
        assert!(schema.parameters.get("title").is_none());
    }
}
