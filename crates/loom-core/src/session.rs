// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use loom_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Maximum output tokens the current model will produce in one turn,
    /// reported by the model catalog.  Reserved out of `input_budget`.
    pub max_output_tokens: usize,
    /// Token overhead for things sent with every request but not stored in
    /// `messages` (tool schemas, dynamic context block).  Refreshed by the
    /// agent loop before each model call.
    pub schema_overhead: usize,
    /// Running correction factor applied to the chars/4 token estimate,
    /// updated from the provider's actual reported input token count.
    pub calibration_factor: f32,
    /// Running total of prompt-cache read tokens for this session.
    pub cache_read_total: u64,
    /// Running total of prompt-cache write tokens for this session.
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Usable input budget: the context window minus the reserved output
    /// allowance.  Never goes negative; falls back to the full window when
    /// the model's output reservation would exceed it.
    pub fn input_budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.max_output_tokens)
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        let budget = self.input_budget();
        if budget == 0 { return false; }
        let calibrated = (self.token_count + self.schema_overhead) as f32 * self.calibration_factor;
        (calibrated / budget as f32) >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// Fold a provider's actual reported input-token count into the running
    /// calibration factor.  `estimated` is what the chars/4 heuristic (plus
    /// schema overhead) predicted for the same request.  A simple exponential
    /// moving average keeps the factor from swinging wildly on any single
    /// outlier turn (e.g. a response that was mostly cached).
    pub fn update_calibration(&mut self, actual_input: u32, estimated: usize) {
        if estimated == 0 || actual_input == 0 {
            return;
        }
        let observed = actual_input as f32 / estimated as f32;
        const ALPHA: f32 = 0.3;
        self.calibration_factor = self.calibration_factor * (1.0 - ALPHA) + observed * ALPHA;
    }

    /// Record prompt-cache usage reported for the most recent turn.
    pub fn add_cache_usage(&mut self, cache_read_tokens: u32, cache_write_tokens: u32) {
        self.cache_read_total += cache_read_tokens as u64;
        self.cache_write_total += cache_write_tokens as u64;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
