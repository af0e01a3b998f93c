// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Centralised tool-registry builder.
//!
//! All callers (CI runner, conversation runner, TUI, sub-agents) use
//! `build_tool_registry` with the appropriate [`ToolSetProfile`] instead of
//! each inlining their own registration loop.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use loom_config::{AgentMode, Config};
use loom_model::ModelProvider;
use loom_tools::{
    events::ToolEvent, ApplyPatchTool, AskQuestionTool, DeleteFileTool, EditFileTool, FsTool,
    GlobFileSearchTool, GlobTool, GrepTool, ListDirTool, LoadSkillTool, ReadFileTool,
    ReadLintsTool, RunTerminalCommandTool, SearchCodebaseTool, SendDmailTool, ShellTool,
    SwitchModeTool, TodoWriteTool, ToolRegistry, UpdateMemoryTool, WriteTool,
};

use loom_core::AgentRuntimeContext;

use crate::context::ToolSetProfile;
use crate::task_tool::TaskTool;

/// Build a [`ToolRegistry`] populated according to the given `profile`.
///
/// This is the single canonical place where tools are wired up.  Adding a
/// new tool to loom means adding it here once and it will appear in every
/// appropriate profile automatically.
///
/// ### Shared-state parameters
///
/// * `mode_lock` — the **same** `Arc` that will be passed to `Agent::new()`.
///   `SwitchModeTool` holds a clone so that mode changes are immediately
///   visible to the agent loop via `drain_tool_events`.
/// * `tool_event_tx` — the sending half of the channel whose receiving end
///   is passed to `Agent::new()`.  `TodoWriteTool` and `SwitchModeTool` send
///   events here; the agent drains them after each tool execution.
/// * `sub_agent_runtime` — inherited by `TaskTool` sub-agents (project root,
///   CI/git notes, AGENTS.md).  Only used for the `Full` profile; pass
///   `AgentRuntimeContext::default()` otherwise.
pub fn build_tool_registry(
    cfg: &Config,
    model: Arc<dyn ModelProvider>,
    profile: ToolSetProfile,
    mode_lock: Arc<Mutex<AgentMode>>,
    tool_event_tx: mpsc::Sender<ToolEvent>,
    sub_agent_runtime: AgentRuntimeContext,
) -> ToolRegistry {
    match profile {
        ToolSetProfile::Full {
            question_tx,
            todos,
            task_depth,
        } => {
            let reg = ToolRegistry::new();

            reg.register(ReadFileTool).expect("duplicate builtin tool name");
            reg.register(ListDirTool).expect("duplicate builtin tool name");
            reg.register(FsTool).expect("duplicate builtin tool name");
            reg.register(GlobFileSearchTool).expect("duplicate builtin tool name");
            reg.register(GlobTool).expect("duplicate builtin tool name");
            reg.register(GrepTool).expect("duplicate builtin tool name");
            reg.register(SearchCodebaseTool).expect("duplicate builtin tool name");
            reg.register(ReadLintsTool).expect("duplicate builtin tool name");
            reg.register(UpdateMemoryTool {
                memory_file: cfg.tools.memory.memory_file.clone(),
            })
            .expect("duplicate builtin tool name");
            // Only register ask_question when a TUI channel is available.
            // In headless/CI/sub-agent mode there is no UI to display the modal,
            // so we omit the tool entirely — the model won't attempt to call it.
            if let Some(tx) = question_tx {
                reg.register(AskQuestionTool::new_tui(tx)).expect("duplicate builtin tool name");
            }
            reg.register(TodoWriteTool::new(todos, tool_event_tx.clone()))
                .expect("duplicate builtin tool name");
            reg.register(SwitchModeTool::new(mode_lock, tool_event_tx))
                .expect("duplicate builtin tool name");
            reg.register(WriteTool).expect("duplicate builtin tool name");
            reg.register(EditFileTool).expect("duplicate builtin tool name");
            reg.register(DeleteFileTool).expect("duplicate builtin tool name");
            reg.register(ApplyPatchTool).expect("duplicate builtin tool name");
            reg.register(SendDmailTool).expect("duplicate builtin tool name");
            reg.register(RunTerminalCommandTool {
                timeout_secs: cfg.tools.timeout_secs,
            })
            .expect("duplicate builtin tool name");
            reg.register(ShellTool {
                timeout_secs: cfg.tools.timeout_secs,
            })
            .expect("duplicate builtin tool name");
            reg.register(TaskTool::new(
                model,
                Arc::new(cfg.clone()),
                task_depth,
                sub_agent_runtime.clone(),
            ))
            .expect("duplicate builtin tool name");
            reg.register(LoadSkillTool::new(sub_agent_runtime.skills.clone()))
                .expect("duplicate builtin tool name");

            reg
        }

        ToolSetProfile::SubAgent { todos } => {
            let reg = ToolRegistry::new();

            reg.register(ReadFileTool).expect("duplicate builtin tool name");
            reg.register(ListDirTool).expect("duplicate builtin tool name");
            reg.register(FsTool).expect("duplicate builtin tool name");
            reg.register(GlobFileSearchTool).expect("duplicate builtin tool name");
            reg.register(GlobTool).expect("duplicate builtin tool name");
            reg.register(GrepTool).expect("duplicate builtin tool name");
            reg.register(SearchCodebaseTool).expect("duplicate builtin tool name");
            reg.register(ReadLintsTool).expect("duplicate builtin tool name");
            reg.register(UpdateMemoryTool {
                memory_file: cfg.tools.memory.memory_file.clone(),
            })
            .expect("duplicate builtin tool name");
            reg.register(AskQuestionTool::new()).expect("duplicate builtin tool name");
            reg.register(TodoWriteTool::new(todos, tool_event_tx.clone()))
                .expect("duplicate builtin tool name");
            reg.register(SwitchModeTool::new(mode_lock, tool_event_tx))
                .expect("duplicate builtin tool name");
            reg.register(WriteTool).expect("duplicate builtin tool name");
            reg.register(EditFileTool).expect("duplicate builtin tool name");
            reg.register(DeleteFileTool).expect("duplicate builtin tool name");
            reg.register(ApplyPatchTool).expect("duplicate builtin tool name");
            reg.register(SendDmailTool).expect("duplicate builtin tool name");
            reg.register(RunTerminalCommandTool {
                timeout_secs: cfg.tools.timeout_secs,
            })
            .expect("duplicate builtin tool name");
            reg.register(ShellTool {
                timeout_secs: cfg.tools.timeout_secs,
            })
            .expect("duplicate builtin tool name");
            // TaskTool intentionally omitted to limit sub-agent nesting
            reg.register(LoadSkillTool::new(sub_agent_runtime.skills.clone()))
                .expect("duplicate builtin tool name");

            reg
        }
    }
}
