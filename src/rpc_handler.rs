// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use loom_bootstrap::{Soul, TurnOutcome};
use loom_rpc::{RpcError, RpcHandler, RpcServer};

use crate::external_tool::ExternalTool;

/// `initialize`/`prompt`/`cancel`/`shutdown` over one live `Soul`. Only one
/// `prompt` may be in flight at a time — a second concurrent `prompt` gets
/// `RpcError::in_flight_prompt()` rather than queueing, since a turn mutates
/// the single shared `Agent`/`Session` state.
pub struct LoomRpcHandler {
    soul: Arc<Mutex<Soul>>,
    session_id: String,
    protocol_version: String,
    turn_counter: AtomicU32,
    in_flight: Mutex<Option<CancellationToken>>,
}

impl LoomRpcHandler {
    pub fn new(soul: Arc<Mutex<Soul>>, session_id: String, protocol_version: String) -> Self {
        Self {
            soul,
            session_id,
            protocol_version,
            turn_counter: AtomicU32::new(0),
            in_flight: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RpcHandler for LoomRpcHandler {
    async fn handle(
        self: Arc<Self>,
        server: Arc<RpcServer>,
        id: Value,
        method: String,
        params: Option<Value>,
    ) {
        match method.as_str() {
            "initialize" => self.handle_initialize(&server, id, params).await,
            "prompt" => self.handle_prompt(server, id, params).await,
            "cancel" => self.handle_cancel(&server, id).await,
            "shutdown" => self.handle_shutdown(server, id).await,
            other => {
                let _ = server.respond_err(id, RpcError::method_not_found(other));
            }
        }
    }
}

impl LoomRpcHandler {
    /// Register any client-declared tools from `params.tools`, then reply
    /// with the protocol version, capability flags, and the slash commands
    /// this session can resolve. `params.tools` entries are
    /// `{name, description, parameters}`; a name colliding with a builtin
    /// fails the whole call with `-32001` (the client should not assume any
    /// of its tools were partially registered), and a non-object schema
    /// fails with `-32602`.
    async fn handle_initialize(self: &Arc<Self>, server: &Arc<RpcServer>, id: Value, params: Option<Value>) {
        let soul = self.soul.lock().await;
        let registry = Arc::clone(soul.agent().tools());

        if let Some(tools) = params.as_ref().and_then(|p| p.get("tools")).and_then(Value::as_array) {
            for entry in tools {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    let _ = server.respond_err(
                        id,
                        RpcError::invalid_params("external tool entry is missing a string `name`"),
                    );
                    return;
                };
                let description = entry
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let Some(schema) = entry.get("parameters") else {
                    let _ = server.respond_err(
                        id,
                        RpcError::invalid_params(format!(
                            "external tool {name:?} is missing a `parameters` schema"
                        )),
                    );
                    return;
                };
                if !schema.is_object() {
                    let _ = server.respond_err(
                        id,
                        RpcError::invalid_params(format!(
                            "external tool {name:?} has a malformed `parameters` schema"
                        )),
                    );
                    return;
                }
                if registry.check_external_name(name).is_err() {
                    let _ = server.respond_err(id, RpcError::external_tool_conflict(name));
                    return;
                }
                let tool = ExternalTool::new(
                    name.to_string(),
                    description,
                    schema.clone(),
                    Arc::clone(server),
                );
                if registry.register(tool).is_err() {
                    let _ = server.respond_err(id, RpcError::external_tool_conflict(name));
                    return;
                }
            }
        }

        let slash_commands: Vec<Value> = soul
            .commands()
            .iter()
            .map(|c| json!({"command": c.command, "name": c.name, "description": c.description}))
            .collect();

        let _ = server.respond_ok(
            id,
            json!({
                "protocol_version": self.protocol_version,
                "session_id": self.session_id,
                "capabilities": {
                    "approvals": true,
                    "cancellation": true,
                    "external_tools": true,
                    "yolo": soul.is_yolo(),
                },
                "slash_commands": slash_commands,
            }),
        );
    }

    async fn handle_prompt(self: &Arc<Self>, server: Arc<RpcServer>, id: Value, params: Option<Value>) {
        let text = match params
            .as_ref()
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
        {
            Some(t) => t.to_string(),
            None => {
                let _ = server.respond_err(
                    id,
                    RpcError::invalid_params("`prompt` requires a string `text` field"),
                );
                return;
            }
        };

        {
            let mut slot = self.in_flight.lock().await;
            if slot.is_some() {
                let _ = server.respond_err(id, RpcError::in_flight_prompt());
                return;
            }
            *slot = Some(CancellationToken::new());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let cancel = this
                .in_flight
                .lock()
                .await
                .clone()
                .expect("in_flight set just above");
            let turn = this.turn_counter.fetch_add(1, Ordering::SeqCst);

            let outcome = {
                let mut soul = this.soul.lock().await;
                soul.run_turn(&text, turn, cancel).await
            };

            *this.in_flight.lock().await = None;

            match outcome {
                Ok(TurnOutcome::Finished) => {
                    let _ = server.respond_ok(id, json!({"status": "finished"}));
                }
                Ok(TurnOutcome::Interrupted { reason }) => {
                    let _ = server
                        .respond_ok(id, json!({"status": "interrupted", "reason": reason}));
                }
                Err(err) => {
                    let _ = server.respond_err(id, RpcError::provider_error(err.to_string()));
                }
            }
        });
    }

    /// Cancel whatever prompt is in flight, close the wire bus's recorder and
    /// await its final flush, then reply and exit. Order matters: the reply
    /// must go out before the process exits, and the recorder must be fully
    /// flushed before we claim `{ok:true}`.
    async fn handle_shutdown(self: &Arc<Self>, server: Arc<RpcServer>, id: Value) {
        if let Some(token) = self.in_flight.lock().await.as_ref() {
            token.cancel();
        }
        {
            let soul = self.soul.lock().await;
            soul.bus().shutdown();
            soul.bus().join().await;
        }
        let _ = server.respond_ok(id, json!({"ok": true}));
        std::process::exit(0);
    }

    async fn handle_cancel(self: &Arc<Self>, server: &Arc<RpcServer>, id: Value) {
        // `{ok:true}` either way: a prompt that already finished (or was
        // never started) is not a protocol error, just a no-op cancel.
        if let Some(token) = self.in_flight.lock().await.as_ref() {
            token.cancel();
        }
        let _ = server.respond_ok(id, json!({"ok": true}));
    }
}
