// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::protocol::{
    err_response, notification_line, ok_response, parse_incoming, request_line, IncomingMessage,
    RpcError,
};

/// Implements the domain-specific behavior behind `initialize`/`prompt`/
/// `cancel`/`shutdown` (and any externally-registered methods). The
/// transport (this crate) only knows how to frame and route lines; method
/// semantics live entirely in the handler the caller supplies.
///
/// `handle` receives the server handle so it can emit `event`/`request`
/// notifications (and await outbound-request replies) while it works, and
/// is expected to eventually resolve `id` itself via
/// [`RpcServer::respond_ok`] or [`RpcServer::respond_err`] — typically from
/// a spawned task, since a `prompt` call may run far longer than a single
/// dispatch tick.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(
        self: std::sync::Arc<Self>,
        server: std::sync::Arc<RpcServer>,
        id: Value,
        method: String,
        params: Option<Value>,
    );
}

struct PendingOutbound {
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// Line-delimited JSON-RPC server over any `AsyncWrite` sink (stdout in
/// production, an in-memory buffer in tests). Lines are UTF-8; malformed
/// byte sequences on the input side are lossily replaced rather than
/// crashing the server, per the framing contract.
pub struct RpcServer {
    writer: Mutex<Box<dyn AsyncWriteSink>>,
    next_outbound_id: AtomicU64,
    pending_outbound: Mutex<HashMap<String, PendingOutbound>>,
}

/// Object-safe wrapper so `RpcServer` doesn't need to be generic over `W`.
trait AsyncWriteSink: Send {
    fn write_line(&mut self, line: &str) -> std::io::Result<()>;
}

struct SyncWriterAdapter<W>(W);

impl<W: std::io::Write + Send> AsyncWriteSink for SyncWriterAdapter<W> {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.0.write_all(line.as_bytes())?;
        self.0.write_all(b"\n")?;
        self.0.flush()
    }
}

impl RpcServer {
    /// Build a server writing to `writer` (e.g. `std::io::stdout()`).
    pub fn new(writer: impl std::io::Write + Send + 'static) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            writer: Mutex::new(Box::new(SyncWriterAdapter(writer))),
            next_outbound_id: AtomicU64::new(1),
            pending_outbound: Mutex::new(HashMap::new()),
        })
    }

    fn write_value(&self, value: &Value) -> anyhow::Result<()> {
        let line = serde_json::to_string(value)?;
        self.writer
            .lock()
            .unwrap()
            .write_line(&line)
            .map_err(anyhow::Error::from)
    }

    /// Reply to an inbound request with a success result.
    pub fn respond_ok(&self, id: Value, result: Value) -> anyhow::Result<()> {
        self.write_value(&ok_response(id, result))
    }

    /// Reply to an inbound request with an error.
    pub fn respond_err(&self, id: Value, error: RpcError) -> anyhow::Result<()> {
        self.write_value(&err_response(id, &error))
    }

    /// Emit a fire-and-forget `event` notification (wire envelopes land
    /// here).
    pub fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.write_value(&notification_line(method, params))
    }

    /// Send an outbound request (`ApprovalRequest`/`ToolCallRequest`) and
    /// await the client's reply. The returned future resolves once a
    /// `Response` line with a matching id is observed by [`RpcServer::ingest`],
    /// or never, if the peer hangs up — callers should race this against a
    /// cancellation token.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Result<Value, RpcError>> {
        let id = self.next_outbound_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_outbound
            .lock()
            .unwrap()
            .insert(id.clone(), PendingOutbound { reply: tx });
        self.write_value(&request_line(Value::String(id.clone()), method, params))?;
        Ok(rx.await.unwrap_or_else(|_| {
            Err(RpcError::internal("outbound request dropped before a reply arrived"))
        }))
    }

    /// Feed one decoded line to the server: dispatches requests to
    /// `handler`, resolves outbound replies, and reports protocol
    /// violations. Does not block on request handling — `handler.handle`
    /// is expected to do its own spawning for long-running work.
    pub fn ingest(self: &std::sync::Arc<Self>, raw: Value, handler: &std::sync::Arc<dyn RpcHandler>) {
        match parse_incoming(&raw) {
            Some(IncomingMessage::Request { id, method, params }) => {
                debug!(%method, %id, "dispatching rpc request");
                let handler = handler.clone();
                let server = self.clone();
                tokio::spawn(async move {
                    handler.handle(server, id, method, params).await;
                });
            }
            Some(IncomingMessage::Notification { method, .. }) => {
                debug!(%method, "ignoring inbound notification (no id to reply to)");
            }
            Some(IncomingMessage::Response { id, outcome }) => {
                let key = match &id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let pending = self.pending_outbound.lock().unwrap().remove(&key);
                match pending {
                    Some(p) => {
                        let _ = p.reply.send(outcome);
                    }
                    None => {
                        warn!(id = %key, "response id does not match any outstanding request");
                        let _ = self.respond_err(id, RpcError::invalid_request(
                            "response id does not match any outstanding request",
                        ));
                    }
                }
            }
            None => {
                warn!("received a JSON value that is neither a request nor a response");
                let _ = self.respond_err(Value::Null, RpcError::invalid_request(
                    "message is neither a request nor a response",
                ));
            }
        }
    }

    /// Drive the server off an async line source (stdin in production)
    /// until the source is exhausted (EOF, typically a closed stdin, which
    /// callers should treat as an implicit cancel).
    pub async fn serve(
        self: std::sync::Arc<Self>,
        reader: impl AsyncBufRead + Unpin,
        handler: std::sync::Arc<dyn RpcHandler>,
    ) {
        let mut lines = reader.lines();
        loop {
            let next = lines.next_line().await;
            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("rpc input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "error reading rpc input; treating as eof");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(raw) => self.ingest(raw, &handler),
                Err(e) => {
                    warn!(error = %e, "malformed json on rpc input");
                    let _ = self.respond_err(Value::Null, RpcError::parse_error(e.to_string()));
                }
            }
        }
    }
}

/// Decode a raw byte buffer as UTF-8, lossily replacing any invalid
/// sequences, matching the framing contract's "never crash on malformed
/// input" requirement. Exposed for callers reading raw bytes (rather than
/// `tokio`'s UTF-8-validating line reader) off stdin.
pub fn decode_line_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::BufReader as TokioBufReader;

    struct EchoHandler;

    #[async_trait]
    impl RpcHandler for EchoHandler {
        async fn handle(
            self: Arc<Self>,
            server: Arc<RpcServer>,
            id: Value,
            method: String,
            params: Option<Value>,
        ) {
            if method == "boom" {
                let _ = server.respond_err(id, RpcError::method_not_found(&method));
                return;
            }
            let _ = server.respond_ok(id, params.unwrap_or(Value::Null));
        }
    }

    fn server_with_sink() -> (Arc<RpcServer>, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let buf2 = buf.clone();
        struct Sink(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Sink {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        (RpcServer::new(Sink(buf2)), buf)
    }

    #[tokio::test]
    async fn request_dispatches_and_writes_response() {
        let (server, out) = server_with_sink();
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let line = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"echo","params":{"x":1}});
        server.ingest(line, &handler);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let written = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(written.contains("\"result\""));
        assert!(written.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn unmatched_response_id_gets_invalid_request_error() {
        let (server, out) = server_with_sink();
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let line = serde_json::json!({"jsonrpc":"2.0","id":"stale","result":{}});
        server.ingest(line, &handler);
        let written = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(written.contains("-32600"));
    }

    #[tokio::test]
    async fn serve_exits_cleanly_on_eof() {
        let (server, _out) = server_with_sink();
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let input = TokioBufReader::new(std::io::Cursor::new(Vec::<u8>::new()));
        server.serve(input, handler).await;
    }

    #[tokio::test]
    async fn malformed_json_reports_parse_error() {
        let (server, out) = server_with_sink();
        let handler: Arc<dyn RpcHandler> = Arc::new(EchoHandler);
        let input = TokioBufReader::new(std::io::Cursor::new(b"{not json\n".to_vec()));
        server.serve(input, handler).await;
        let written = String::from_utf8(out.lock().unwrap().clone()).unwrap();
        assert!(written.contains("-32700"));
    }
}
