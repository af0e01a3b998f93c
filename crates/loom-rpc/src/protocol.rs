// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(-32700, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(-32600, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(-32000, message)
    }

    pub fn external_tool_conflict(tool_name: &str) -> Self {
        Self::new(-32001, format!("external tool name conflicts with a builtin: {tool_name}"))
    }

    pub fn in_flight_prompt() -> Self {
        Self::new(-32002, "a prompt is already in flight for this session")
    }

    pub fn provider_error(message: impl Into<String>) -> Self {
        Self::new(-32003, message)
    }
}

/// One decoded line from the peer: either an inbound method call
/// (`Request`/`Notification`, distinguished by the presence of `id`) or a
/// reply to a request this side sent earlier (`Response`).
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        outcome: Result<Value, RpcError>,
    },
}

/// Parse one line of JSON-RPC traffic. Returns `None` for a syntactically
/// valid JSON value that is neither a recognizable request nor response
/// shape (e.g. a bare array or scalar) — callers should treat that as a
/// parse-level protocol violation.
pub fn parse_incoming(raw: &Value) -> Option<IncomingMessage> {
    let obj = raw.as_object()?;

    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = obj.get("params").cloned();
        return Some(match obj.get("id").cloned() {
            Some(id) => IncomingMessage::Request {
                id,
                method: method.to_string(),
                params,
            },
            None => IncomingMessage::Notification {
                method: method.to_string(),
                params,
            },
        });
    }

    let id = obj.get("id").cloned()?;
    if let Some(err) = obj.get("error") {
        let err: RpcError = serde_json::from_value(err.clone()).ok()?;
        return Some(IncomingMessage::Response {
            id,
            outcome: Err(err),
        });
    }
    let result = obj.get("result").cloned().unwrap_or(Value::Null);
    Some(IncomingMessage::Response {
        id,
        outcome: Ok(result),
    })
}

/// Build a successful response line.
pub fn ok_response(id: Value, result: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Build an error response line.
pub fn err_response(id: Value, error: &RpcError) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

/// Build an outbound request line (server -> client), expecting a reply.
pub fn request_line(id: Value, method: &str, params: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

/// Build an outbound notification line (server -> client), no reply expected.
pub fn notification_line(method: &str, params: Value) -> Value {
    serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_with_id_parses_as_request() {
        let raw = json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}});
        match parse_incoming(&raw).unwrap() {
            IncomingMessage::Request { id, method, .. } => {
                assert_eq!(id, json!(1));
                assert_eq!(method, "initialize");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn method_without_id_parses_as_notification() {
        let raw = json!({"jsonrpc":"2.0","method":"ping"});
        assert!(matches!(
            parse_incoming(&raw).unwrap(),
            IncomingMessage::Notification { .. }
        ));
    }

    #[test]
    fn result_with_id_parses_as_response() {
        let raw = json!({"jsonrpc":"2.0","id":"r1","result":{"decision":"approve"}});
        match parse_incoming(&raw).unwrap() {
            IncomingMessage::Response { id, outcome } => {
                assert_eq!(id, json!("r1"));
                assert!(outcome.is_ok());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn error_with_id_parses_as_response_err() {
        let raw = json!({"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"bad params"}});
        match parse_incoming(&raw).unwrap() {
            IncomingMessage::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.code, -32602);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bare_scalar_does_not_parse() {
        let raw = json!(42);
        assert!(parse_incoming(&raw).is_none());
    }
}

impl std::fmt::Display for IncomingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncomingMessage::Request { method, .. } => write!(f, "Request({method})"),
            IncomingMessage::Notification { method, .. } => write!(f, "Notification({method})"),
            IncomingMessage::Response { id, .. } => write!(f, "Response({id})"),
        }
    }
}
