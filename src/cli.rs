// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// `loom info` and `loom mcp` are the only real subcommands; running the
/// binary with no subcommand starts the JSON-RPC wire server on stdio.
#[derive(Parser, Debug)]
#[command(
    name = "loom",
    about = "A JSON-RPC-driven coding-agent core",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Project/work directory the agent operates in (defaults to cwd).
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Session id to start (or resume, if it already has persisted state).
    /// Mutually exclusive with `--continue`.
    #[arg(long, value_name = "ID", conflicts_with = "continue_")]
    pub session: Option<String>,

    /// Resume the most recently active session under the share directory.
    /// Mutually exclusive with `--session`.
    #[arg(long = "continue", conflicts_with = "session")]
    pub continue_: bool,

    /// Named provider config key, or inline `provider/model` override.
    #[arg(long, value_name = "KEY")]
    pub config: Option<String>,

    /// Path to an explicit config.toml layer (applied after the normal
    /// search-path layers, highest precedence).
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Model override: "provider/model", a registered provider id, or a
    /// bare model name.
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Request extended thinking / reasoning traces, where the provider
    /// supports it. Mutually exclusive with `--no-thinking`.
    #[arg(long, conflicts_with = "no_thinking")]
    pub thinking: bool,

    /// Explicitly disable extended thinking.
    #[arg(long)]
    pub no_thinking: bool,

    /// Blanket-approve every tool call; bypasses the approval coordinator
    /// entirely. Off by default; a deliberate, explicit opt-in.
    #[arg(long)]
    pub yolo: bool,

    /// Named subagent persona (from `.agents/agents/`, `.claude/agents/`,
    /// etc.) to run as, instead of the default agent. Mutually exclusive
    /// with `--agent-file`.
    #[arg(long, value_name = "NAME", conflicts_with = "agent_file")]
    pub agent: Option<String>,

    /// Path to an AGENT.md-style file defining an ad-hoc agent persona.
    /// Mutually exclusive with `--agent`.
    #[arg(long, value_name = "FILE", conflicts_with = "agent")]
    pub agent_file: Option<PathBuf>,

    /// Path to an MCP server config file (validated by `loom mcp`; MCP
    /// transport itself is not implemented by this core).
    #[arg(long, value_name = "FILE")]
    pub mcp_config_file: Option<PathBuf>,

    /// Inline MCP server config, as JSON.
    #[arg(long, value_name = "JSON")]
    pub mcp_config: Option<String>,

    /// Additional directory to search for skills, beyond the standard
    /// `.agents/skills/`, `.claude/skills/`, ... hierarchy.
    #[arg(long, value_name = "DIR")]
    pub skills_dir: Option<PathBuf>,

    /// Hard cap on model/tool round-trips within a single turn.
    #[arg(long, value_name = "N")]
    pub max_steps_per_turn: Option<u32>,

    /// Transient provider-error retries within a single step.
    #[arg(long, value_name = "N")]
    pub max_retries_per_step: Option<u32>,

    /// Upper bound on flow-mode ("Ralph loop") re-prompts.
    #[arg(long, value_name = "N")]
    pub max_ralph_iterations: Option<u32>,

    /// Increase log verbosity (writes to stderr; off by default so a wire
    /// client never sees interleaved log lines next to its stdout frames).
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print effective configuration and capabilities, then exit.
    Info {
        /// Emit machine-readable JSON instead of the human-readable form.
        #[arg(long)]
        json: bool,
    },

    /// Validate an MCP server configuration without starting a session.
    ///
    /// MCP transport is out of scope for this core; this subcommand only
    /// checks that `--mcp-config-file`/`--mcp-config` parse into a
    /// well-formed server list, so a caller can fail fast on a typo'd
    /// config before wiring a real MCP-capable front end around this binary.
    Mcp {
        /// Path to an MCP server config file.
        #[arg(long, value_name = "FILE")]
        mcp_config_file: Option<PathBuf>,

        /// Inline MCP server config, as JSON.
        #[arg(long, value_name = "JSON")]
        mcp_config: Option<String>,
    },
}

impl Cli {
    /// `true` when extended thinking should be requested. `--thinking` and
    /// `--no-thinking` are declared `conflicts_with` each other above, so
    /// clap already rejects passing both; this just reads the survivor.
    pub fn thinking_requested(&self) -> bool {
        self.thinking && !self.no_thinking
    }
}
