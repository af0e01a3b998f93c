// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Async rendezvous coordinator gating dangerous tool calls behind a human
//! (or a "Yolo" auto-approve policy) decision delivered over the wire bus.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use loom_wire::{ApprovalDecision, WireBus, WireEvent};

/// A pending request's fingerprint, used to memoize `approve_for_session`.
fn fingerprint(sender: &str, action: &str) -> String {
    format!("{sender}::{action}")
}

struct Pending {
    fingerprint: String,
    reply: oneshot::Sender<ApprovalDecision>,
}

/// Gates tool calls behind approval. One coordinator is shared across a
/// whole process lifetime (not just one turn) so that "approve for session"
/// memoization survives across turns, per design.
pub struct ApprovalCoordinator {
    bus: std::sync::Arc<WireBus>,
    yolo: bool,
    session_approved: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl ApprovalCoordinator {
    pub fn new(bus: std::sync::Arc<WireBus>, yolo: bool) -> Self {
        Self {
            bus,
            yolo,
            session_approved: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Request approval for one action. Resolves immediately under the Yolo
    /// policy or a prior `approve_for_session` grant; otherwise suspends
    /// until [`ApprovalCoordinator::resolve`] is called with a matching
    /// request id, or [`ApprovalCoordinator::cancel_all`] cancels the turn.
    pub async fn request(
        &self,
        action: &str,
        description: &str,
        sender: &str,
        tool_call_id: &str,
    ) -> ApprovalDecision {
        let fp = fingerprint(sender, action);

        if self.yolo {
            debug!(%action, %sender, "approval auto-granted by yolo policy");
            return ApprovalDecision::Approve;
        }
        if self.session_approved.lock().unwrap().contains(&fp) {
            debug!(%action, %sender, "approval short-circuited by session grant");
            return ApprovalDecision::Approve;
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            request_id.clone(),
            Pending {
                fingerprint: fp,
                reply: tx,
            },
        );

        self.bus.publish(WireEvent::ApprovalRequest {
            request_id: request_id.clone(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: action.to_string(),
            description: description.to_string(),
        });

        match rx.await {
            Ok(decision) => decision,
            // The sender half was dropped without a call to `resolve` or
            // `cancel_all` — treat it the same as an explicit cancellation.
            Err(_) => ApprovalDecision::RejectWithReason { reason: "cancelled".into() },
        }
    }

    /// Resolve a pending request by id. Returns `false` if no such request
    /// was pending (already resolved, or an id from a stale/unknown turn).
    pub fn resolve(&self, request_id: &str, decision: ApprovalDecision) -> bool {
        let pending = self.pending.lock().unwrap().remove(request_id);
        let Some(pending) = pending else {
            return false;
        };
        self.bus.publish(WireEvent::ApprovalResponse {
            request_id: request_id.to_string(),
            decision: decision.clone(),
        });
        if decision == ApprovalDecision::ApproveForSession {
            self.session_approved.lock().unwrap().insert(pending.fingerprint);
        }
        let decision = match decision {
            ApprovalDecision::ApproveForSession => ApprovalDecision::Approve,
            other => other,
        };
        let _ = pending.reply.send(decision);
        true
    }

    /// Resolve every currently pending request as rejected with reason
    /// "cancelled". Called when a turn's cancellation token fires.
    pub fn cancel_all(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (request_id, p) in pending {
            let decision = ApprovalDecision::RejectWithReason { reason: "cancelled".into() };
            self.bus.publish(WireEvent::ApprovalResponse {
                request_id,
                decision: decision.clone(),
            });
            let _ = p.reply.send(decision);
        }
    }

    /// True if Yolo (blanket auto-approve) is in effect.
    pub fn is_yolo(&self) -> bool {
        self.yolo
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> std::sync::Arc<WireBus> {
        let dir = tempfile::tempdir().unwrap();
        WireBus::new("s1", dir.path().join("wire.jsonl"))
    }

    #[tokio::test]
    async fn yolo_auto_approves() {
        let coord = ApprovalCoordinator::new(bus(), true);
        let decision = coord.request("shell", "rm -rf /tmp/x", "agent", "call-1").await;
        assert_eq!(decision, ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn request_suspends_until_resolved() {
        let coord = std::sync::Arc::new(ApprovalCoordinator::new(bus(), false));
        let coord2 = coord.clone();
        let handle = tokio::spawn(async move {
            coord2.request("shell", "echo hi", "agent", "call-1").await
        });
        // Give the spawned task a moment to register its pending request.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pending_id = {
            let pending = coord.pending.lock().unwrap();
            pending.keys().next().cloned().unwrap()
        };
        assert!(coord.resolve(&pending_id, ApprovalDecision::Approve));
        assert_eq!(handle.await.unwrap(), ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn approve_for_session_memoizes_fingerprint() {
        let coord = std::sync::Arc::new(ApprovalCoordinator::new(bus(), false));
        let coord2 = coord.clone();
        let handle = tokio::spawn(async move {
            coord2.request("shell", "echo hi", "agent", "call-1").await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let pending_id = {
            let pending = coord.pending.lock().unwrap();
            pending.keys().next().cloned().unwrap()
        };
        coord.resolve(&pending_id, ApprovalDecision::ApproveForSession);
        assert_eq!(handle.await.unwrap(), ApprovalDecision::Approve);

        // A second request with the same (sender, action) should now
        // short-circuit without ever becoming pending.
        let decision = coord.request("shell", "echo hi again", "agent", "call-2").await;
        assert_eq!(decision, ApprovalDecision::Approve);
        assert!(coord.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_requests_as_cancelled() {
        let coord = std::sync::Arc::new(ApprovalCoordinator::new(bus(), false));
        let coord2 = coord.clone();
        let handle = tokio::spawn(async move {
            coord2.request("shell", "echo hi", "agent", "call-1").await
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        coord.cancel_all();
        assert_eq!(handle.await.unwrap(), ApprovalDecision::RejectWithReason { reason: "cancelled".into() });
    }

    #[tokio::test]
    async fn resolve_unknown_request_id_returns_false() {
        let coord = ApprovalCoordinator::new(bus(), false);
        assert!(!coord.resolve("not-pending", ApprovalDecision::Approve));
    }
}
