// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only JSONL conversation log with checkpoint/revert support.
//!
//! A session's `context.jsonl` is the durable record of its conversation:
//! every [`Message`] is appended as one line, interleaved with lightweight
//! checkpoint and usage markers. Reverting to a checkpoint rotates the
//! current file aside (`context.jsonl` -> `context.<n>.jsonl`) and starts a
//! fresh `context.jsonl` holding only the prefix up to (and including) the
//! checkpoint — the rotated file is never deleted, so the full history stays
//! recoverable on disk even after a rewind.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use loom_model::Message;

/// No checkpoint with the given id exists in this log.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("unknown checkpoint id: {0}")]
pub struct CheckpointNotFound(pub u64);

/// Discriminator value for a [`ContextEntry::Checkpoint`] line. Serializes
/// to exactly `"_checkpoint"` so the entry round-trips as
/// `{role:"_checkpoint", id, note?}`, matching how `Message` entries carry
/// their own `role` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointRole {
    #[serde(rename = "_checkpoint")]
    Checkpoint,
}

/// Discriminator value for a [`ContextEntry::Usage`] line, serializing to
/// `"_usage"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageRole {
    #[serde(rename = "_usage")]
    Usage,
}

/// One line of `context.jsonl`: a conversation [`Message`], a checkpoint
/// marker, or a token-usage snapshot. Disambiguated purely by the value of
/// each variant's own `role` field, so `#[serde(untagged)]` can pick the
/// right one without an external tag wrapping every `Message` too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextEntry {
    Checkpoint {
        role: CheckpointRole,
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Usage {
        role: UsageRole,
        token_count: u64,
    },
    Message(Message),
}

/// Single-writer append-only store for one session's conversation log.
///
/// All mutation goes through a `tokio::sync::Mutex`-guarded file handle —
/// the same single-writer-file-append discipline the step driver already
/// uses for its in-memory session, just made durable.
pub struct ContextStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: Vec<ContextEntry>,
    file: tokio::fs::File,
    rotation: u32,
}

impl ContextStore {
    /// Open (or create) the context log rooted at `dir` (typically
    /// `<share>/sessions/<session_id>/`). Replays any existing
    /// `context.jsonl` into memory.
    pub async fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("context.jsonl");
        let entries = read_entries(&path).await?;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        let rotation = next_rotation_index(&dir).await?;
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                entries,
                file,
                rotation,
            }),
        })
    }

    fn path(&self) -> PathBuf {
        self.dir.join("context.jsonl")
    }

    /// Append one message to the log.
    pub async fn append(&self, msg: Message) -> anyhow::Result<()> {
        let entry = ContextEntry::Message(msg);
        self.append_entry(entry).await
    }

    /// Append a checkpoint marker and return its id: one greater than the
    /// highest checkpoint id already in the log (1 if there are none), so
    /// ids stay strictly increasing within a file across rotations. The id
    /// is computed and written under the same lock acquisition to rule out
    /// two concurrent callers racing to the same id.
    pub async fn append_checkpoint(&self, note: Option<String>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let id = inner
            .entries
            .iter()
            .filter_map(|e| match e {
                ContextEntry::Checkpoint { id, .. } => Some(*id),
                _ => None,
            })
            .max()
            .unwrap_or(0)
            + 1;
        append_entry_locked(&mut inner, ContextEntry::Checkpoint {
            role: CheckpointRole::Checkpoint,
            id,
            note,
        })
        .await?;
        Ok(id)
    }

    /// Record a usage snapshot: the running total token count for the session.
    pub async fn record_usage(&self, token_count: u64) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        append_entry_locked(&mut inner, ContextEntry::Usage { role: UsageRole::Usage, token_count })
            .await
    }

    async fn append_entry(&self, entry: ContextEntry) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        append_entry_locked(&mut inner, entry).await
    }

    /// All messages currently in the log, in order (checkpoint/usage markers
    /// excluded — this is what the step driver feeds back to the model).
    pub async fn snapshot(&self) -> Vec<Message> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter_map(|e| match e {
                ContextEntry::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    /// Revert to the given checkpoint: keep everything up to and including
    /// the checkpoint marker, drop everything after it, and optionally
    /// append a synthetic user notice describing the rewind. The discarded
    /// suffix is never lost — the whole pre-revert file is rotated aside to
    /// `context.<n>.jsonl` before the truncated file is rewritten.
    pub async fn revert_to(
        &self,
        checkpoint_id: u64,
        add_user_notice: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;

        let cut = inner
            .entries
            .iter()
            .position(|e| matches!(e, ContextEntry::Checkpoint { id, .. } if *id == checkpoint_id));
        let cut = cut.ok_or(CheckpointNotFound(checkpoint_id))?;

        let rotated_name = format!("context.{}.jsonl", inner.rotation);
        inner.rotation += 1;
        let path = self.path();
        tokio::fs::rename(&path, self.dir.join(&rotated_name))
            .await
            .with_context(|| format!("rotating {}", path.display()))?;
        debug!(rotated_to = %rotated_name, "context log rotated on revert");

        let mut kept: Vec<ContextEntry> = inner.entries[..=cut].to_vec();
        if add_user_notice {
            kept.push(ContextEntry::Message(Message::user(format!(
                "<system>CHECKPOINT {checkpoint_id}</system>"
            ))));
        }

        let mut new_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("reopening {}", path.display()))?;
        for entry in &kept {
            let mut line = serde_json::to_string(entry)?;
            line.push('\n');
            new_file.write_all(line.as_bytes()).await?;
        }
        new_file.flush().await?;

        inner.entries = kept;
        inner.file = new_file;
        Ok(())
    }

    /// Rotate the current log aside and start empty. Used when a session is
    /// explicitly reset rather than reverted to a checkpoint.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.entries.is_empty() {
            let rotated_name = format!("context.{}.jsonl", inner.rotation);
            inner.rotation += 1;
            let path = self.path();
            tokio::fs::rename(&path, self.dir.join(&rotated_name))
                .await
                .with_context(|| format!("rotating {}", path.display()))?;
        }
        let new_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path())
            .await?;
        inner.entries.clear();
        inner.file = new_file;
        Ok(())
    }
}

async fn append_entry_locked(inner: &mut Inner, entry: ContextEntry) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    inner.file.write_all(line.as_bytes()).await?;
    inner.file.flush().await?;
    inner.entries.push(entry);
    Ok(())
}

async fn read_entries(path: &Path) -> anyhow::Result<Vec<ContextEntry>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut entries = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ContextEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed context log line");
            }
        }
    }
    Ok(entries)
}

/// Find the next unused `context.<n>.jsonl` rotation index in `dir`.
async fn next_rotation_index(dir: &Path) -> anyhow::Result<u32> {
    let mut max = 0u32;
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            if let Some(n) = name
                .strip_prefix("context.")
                .and_then(|s| s.strip_suffix(".jsonl"))
                .and_then(|s| s.parse::<u32>().ok())
            {
                max = max.max(n + 1);
            }
        }
    }
    Ok(max)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
