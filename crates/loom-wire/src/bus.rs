// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::envelope::{Envelope, WireEvent};

/// Default capacity of the lossy broadcast channel. Slow or absent live
/// subscribers simply miss events once the ring buffer wraps — only the
/// recorder channel is guaranteed-delivery.
const BROADCAST_CAPACITY: usize = 1024;

/// Multi-producer, multi-consumer event bus for one session.
///
/// Two distinct delivery guarantees are offered on purpose:
/// - [`WireBus::subscribe`] returns a `broadcast::Receiver`: cheap, lossy,
///   fine for UI consumers that only care about "what's happening now".
/// - The JSONL recorder task (spawned by [`WireBus::spawn_recorder`]) is fed
///   through a dedicated unbounded `mpsc` so a burst of events can never be
///   silently dropped from the durable log, even if the recorder task falls
///   behind momentarily.
pub struct WireBus {
    session_id: String,
    seq: AtomicU64,
    live: broadcast::Sender<Envelope>,
    recorder_tx: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    recorder_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WireBus {
    /// Create a bus and spawn its JSONL recorder task, appending to
    /// `wire_log_path`. The recorder task runs until [`WireBus::shutdown`]
    /// closes the producer side, or every clone of the bus is dropped.
    pub fn new(session_id: impl Into<String>, wire_log_path: PathBuf) -> Arc<Self> {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (recorder_tx, recorder_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_recorder(wire_log_path, recorder_rx));
        Arc::new(Self {
            session_id: session_id.into(),
            seq: AtomicU64::new(0),
            live,
            recorder_tx: Mutex::new(Some(recorder_tx)),
            recorder_handle: Mutex::new(Some(handle)),
        })
    }

    /// Publish an event. Assigns the next sequence number, fans it out to
    /// live subscribers (best-effort) and to the durable recorder (always,
    /// unless the bus has already been [`WireBus::shutdown`]).
    pub fn publish(&self, event: WireEvent) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let envelope = Envelope {
            session_id: self.session_id.clone(),
            seq,
            event,
        };
        // Lossy fan-out: a `SendError` here just means there are currently no
        // live subscribers, which is a normal and expected condition.
        let _ = self.live.send(envelope.clone());
        // Durable: an unbounded channel send only fails if the recorder task
        // has terminated (e.g. on an earlier fatal I/O error) or the bus has
        // already been shut down, which we log once and otherwise tolerate —
        // losing the wire recording must never take down the turn in progress.
        let sent = match self.recorder_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        };
        if !sent {
            warn!("wire recorder is gone or shut down; event was not persisted");
        }
    }

    /// Subscribe to the live (lossy) event stream. Subscribers that call
    /// this before the first event of interest is published will see it;
    /// anything published before `subscribe()` is called is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.live.subscribe()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Close the producer side of the recorder channel, draining every live
    /// subscriber of its current backlog implicitly (they simply stop
    /// receiving new events). Does not block — call [`WireBus::join`]
    /// afterwards to await the recorder's final flush. Idempotent.
    pub fn shutdown(&self) {
        self.recorder_tx.lock().unwrap().take();
    }

    /// Await the recorder task's exit, which happens once [`WireBus::shutdown`]
    /// has dropped the last sender and the task has flushed its backlog to
    /// disk. A no-op if the task has already been joined.
    pub async fn join(&self) {
        let handle = self.recorder_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Drains `rx` and appends each envelope as one JSON line. Exits only when
/// every sender half has been dropped.
async fn run_recorder(path: PathBuf, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    let file = match open_append(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open wire log; recording disabled");
            // Drain without writing so publishers never block on a full
            // channel even though persistence is unavailable.
            while rx.recv().await.is_some() {}
            return;
        }
    };
    let mut file = file;
    while let Some(envelope) = rx.recv().await {
        match serde_json::to_string(&envelope) {
            Ok(mut line) => {
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "wire log write failed");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize wire envelope"),
        }
    }
    let _ = file.flush().await;
}

async fn open_append(path: &PathBuf) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_increasing_sequence_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WireBus::new("s1", dir.path().join("wire.jsonl"));
        let mut rx = bus.subscribe();
        bus.publish(WireEvent::TurnBegin { turn: 0 });
        bus.publish(WireEvent::TurnBegin { turn: 1 });
        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
    }

    #[tokio::test]
    async fn subscribe_before_publish_receives_the_event() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WireBus::new("s1", dir.path().join("wire.jsonl"));
        let mut rx = bus.subscribe();
        bus.publish(WireEvent::TurnBegin { turn: 0 });
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.event, WireEvent::TurnBegin { turn: 0 }));
    }

    #[tokio::test]
    async fn recorder_persists_events_to_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("wire.jsonl");
        let bus = WireBus::new("s1", log_path.clone());
        bus.publish(WireEvent::TurnBegin { turn: 0 });
        bus.publish(WireEvent::TurnComplete { turn: 0 });
        // Give the recorder task a chance to drain the unbounded channel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let contents = tokio::fs::read_to_string(&log_path).await.unwrap_or_default();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("turn_begin"));
        assert!(contents.contains("turn_complete"));
    }

    #[tokio::test]
    async fn publish_with_no_live_subscribers_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let bus = WireBus::new("s1", dir.path().join("wire.jsonl"));
        bus.publish(WireEvent::TurnBegin { turn: 0 });
    }
}
