// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context types for agent construction.
//!
//! [`RuntimeContext`] holds environment-detected information (project root,
//! git state, CI environment) that is not part of the config file schema.
//!
//! [`ToolSetProfile`] selects which tools to register, and carries the
//! shared state needed by stateful tools (todos, mode lock, GDB state).

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use tokio::sync::{mpsc, Mutex};

use loom_tools::{
    events::TodoItem,
    QuestionRequest,
};
use loom_runtime::{CiContext, GitContext, SharedAgents, SharedKnowledge, SharedSkills};

// ─── RuntimeContext ───────────────────────────────────────────────────────────

/// Environment-detected context for an agent session.
///
/// This is separate from [`loom_config::AgentConfig`] (which holds only
/// config-file fields) so that the two concerns — "what the user configured"
/// and "what we found at runtime" — stay cleanly separated.
#[derive(Default)]
pub struct RuntimeContext {
    /// Absolute path to the project root (detected from `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Live git metadata (branch, commit, dirty state).
    pub git_context: Option<GitContext>,
    /// CI environment metadata.
    pub ci_context: Option<CiContext>,
    /// Contents of `.loom/context.md`, `AGENTS.md`, or `CLAUDE.md`.
    pub project_context_file: Option<String>,
    /// Text appended after the default system prompt Guidelines section.
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    pub system_prompt_override: Option<String>,
    /// Skills discovered from the standard search hierarchy.
    pub skills: SharedSkills,
    /// Subagents discovered from the standard search hierarchy.
    pub agents: SharedAgents,
    /// Knowledge documents discovered from `.loom/knowledge/`.
    pub knowledge: SharedKnowledge,
    /// Pre-formatted knowledge drift warning, computed once at startup.
    pub knowledge_drift_note: Option<String>,
}

impl RuntimeContext {
    /// Create with auto-detected project, git, and CI context, plus a fresh
    /// discovery pass over skills, subagents, and knowledge documents.
    pub fn auto_detect() -> Self {
        let project_root = loom_runtime::find_project_root().ok();
        let git_context = project_root.as_ref()
            .map(|r| loom_runtime::collect_git_context(r));
        let ci_context = Some(loom_runtime::detect_ci_context());
        let project_context_file = project_root.as_ref()
            .and_then(|r| loom_runtime::load_project_context_file(r));

        let root_ref = project_root.as_deref();
        let skills = SharedSkills::new(loom_runtime::discover_skills(root_ref));
        let agents = SharedAgents::new(loom_runtime::discover_agents(root_ref));
        let knowledge_docs = loom_runtime::discover_knowledge(root_ref);
        let knowledge_drift_note = root_ref.and_then(|root| {
            loom_runtime::format_drift_warnings(&loom_runtime::check_knowledge_drift(
                root,
                &knowledge_docs,
            ))
        });
        let knowledge = SharedKnowledge::new(knowledge_docs);

        Self {
            project_root,
            git_context,
            ci_context,
            project_context_file,
            append_system_prompt: None,
            system_prompt_override: None,
            skills,
            agents,
            knowledge,
            knowledge_drift_note,
        }
    }

    /// Create an empty context (no project/git/CI detection).
    pub fn empty() -> Self {
        Self::default()
    }
}

// ─── ToolSetProfile ───────────────────────────────────────────────────────────

/// Selects which tool set to register and carries the caller-owned shared
/// state that stateful tools require.
///
/// TUI and headless/CI use the same full tool set; only `--mode` (research /
/// plan / agent) controls which tools are exposed to the model. When
/// `question_tx` is `Some`, ask_question uses the TUI channel; when `None`,
/// it uses stdin (headless/CI).
///
/// `mode_lock` and the tool-event channel are intentionally **not** part of
/// this enum — `AgentBuilder::build()` creates them, wires them into the
/// registry, and passes the same instances to `Agent::new()` so that
/// `SwitchModeTool` and `TodoWriteTool` events are correctly observed by the
/// agent loop.
pub enum ToolSetProfile {
    /// Full tool set (TUI and headless/CI). Same tools; mode gates visibility.
    ///
    /// `question_tx`: when `Some`, ask_question routes to the TUI; when `None`, uses stdin.
    Full {
        question_tx: Option<mpsc::Sender<QuestionRequest>>,
        todos: Arc<Mutex<Vec<TodoItem>>>,
        task_depth: Arc<AtomicUsize>,
    },

    /// Sub-agent tool set (Full minus TaskTool to prevent unbounded nesting).
    SubAgent {
        todos: Arc<Mutex<Vec<TodoItem>>>,
    },
}
