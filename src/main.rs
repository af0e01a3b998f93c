// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod external_tool;
mod rpc_handler;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{stdin, BufReader};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use loom_bootstrap::{AgentBuilder, RuntimeContext, Soul, ToolSetProfile};
use loom_config::AgentMode;
use loom_context::ContextStore;
use loom_approval::ApprovalCoordinator;
use loom_rpc::RpcServer;
use loom_wire::WireBus;
use rpc_handler::LoomRpcHandler;

/// Protocol version advertised on `initialize` and used to namespace any
/// future breaking wire changes.
const PROTOCOL_VERSION: &str = "1.1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        return match cmd {
            Commands::Info { json } => run_info(&cli, *json),
            Commands::Mcp {
                mcp_config_file,
                mcp_config,
            } => run_mcp_validate(mcp_config_file.as_deref(), mcp_config.as_deref()),
        };
    }

    run_wire_server(cli).await
}

// ── `loom info` ─────────────────────────────────────────────────────────────

fn run_info(cli: &Cli, as_json: bool) -> anyhow::Result<()> {
    let config = loom_config::load(cli.config_file.as_deref())?;
    let share_dir = loom_config::share_dir();
    let drivers: Vec<&str> = loom_model::list_drivers().iter().map(|d| d.id).collect();

    if as_json {
        #[derive(serde::Serialize)]
        struct InfoJson<'a> {
            protocol_version: &'a str,
            share_dir: String,
            default_mode: String,
            model_provider: &'a str,
            model_name: &'a str,
            yolo: bool,
            known_providers: Vec<&'a str>,
        }
        let out = InfoJson {
            protocol_version: PROTOCOL_VERSION,
            share_dir: share_dir.display().to_string(),
            default_mode: config.agent.default_mode.to_string(),
            model_provider: &config.model.provider,
            model_name: &config.model.name,
            yolo: config.agent.yolo,
            known_providers: drivers,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("loom {}", env!("CARGO_PKG_VERSION"));
    println!("protocol version : {PROTOCOL_VERSION}");
    println!("share dir        : {}", share_dir.display());
    println!("default mode     : {}", config.agent.default_mode);
    println!(
        "model            : {}/{}",
        config.model.provider, config.model.name
    );
    println!("yolo             : {}", config.agent.yolo);
    println!("known providers  : {}", drivers.join(", "));
    Ok(())
}

// ── `loom mcp` ───────────────────────────────────────────────────────────────

/// Validate an MCP server config without starting a session. MCP transport
/// itself is not implemented here — this only checks the config parses into
/// a well-formed server list so a caller building a real MCP front end
/// around this binary can fail fast on a typo'd file.
fn run_mcp_validate(file: Option<&Path>, inline: Option<&str>) -> anyhow::Result<()> {
    let raw = match (file, inline) {
        (Some(path), _) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, Some(json)) => json.to_string(),
        (None, None) => {
            eprintln!("loom mcp: one of --mcp-config-file or --mcp-config is required");
            std::process::exit(2);
        }
    };

    let parsed: serde_json::Value =
        serde_json::from_str(&raw).context("parsing MCP config as JSON")?;

    let servers = parsed
        .get("servers")
        .and_then(serde_json::Value::as_object)
        .or_else(|| parsed.as_object())
        .ok_or_else(|| anyhow::anyhow!("MCP config must be a JSON object (optionally under a top-level \"servers\" key)"))?;

    println!("MCP config OK: {} server(s) declared", servers.len());
    for name in servers.keys() {
        println!("  - {name}");
    }
    println!(
        "\nNote: this build validates MCP configuration only; it does not \
         implement the MCP transport."
    );
    Ok(())
}

// ── Default run mode: the JSON-RPC wire server ──────────────────────────────

async fn run_wire_server(cli: Cli) -> anyhow::Result<()> {
    if let Some(dir) = &cli.work_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("changing to --work-dir {}", dir.display()))?;
    }

    let mut config = loom_config::load(cli.config_file.as_deref())?;
    apply_cli_overrides(&mut config, &cli);
    let config = Arc::new(config);

    // `--model` and `--config` both resolve through the same named-provider
    // lookup; `--model` wins when both are given since it is the more
    // specific of the two.
    let model_cfg = match cli.model.as_ref().or(cli.config.as_ref()) {
        Some(m) => loom_model::resolve_model_from_config(&config, m),
        None => config.model.clone(),
    };
    let model: Arc<dyn loom_model::ModelProvider> =
        Arc::from(loom_model::from_config(&model_cfg)?);

    let mut runtime_ctx = RuntimeContext::auto_detect();
    apply_agent_override(&mut runtime_ctx, &cli)?;
    if let Some(dir) = &cli.skills_dir {
        merge_extra_skills(&mut runtime_ctx, dir);
    }
    let project_root = runtime_ctx.project_root.clone();

    let mode = config.agent.default_mode;
    let profile = ToolSetProfile::Full {
        question_tx: None,
        todos: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        task_depth: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
    };

    let agent = AgentBuilder::new(config.clone())
        .with_runtime_context(runtime_ctx)
        .build(mode, model, profile);

    let session_id = resolve_session_id(&cli);
    let session_dir = loom_config::share_dir()
        .join("sessions")
        .join(&session_id);
    tokio::fs::create_dir_all(&session_dir)
        .await
        .with_context(|| format!("creating session dir {}", session_dir.display()))?;

    let bus = WireBus::new(session_id.clone(), session_dir.join("wire.jsonl"));
    let context = Arc::new(ContextStore::open(session_dir.clone()).await?);
    let approvals = Arc::new(ApprovalCoordinator::new(bus.clone(), cli.yolo || config.agent.yolo));
    let commands = loom_runtime::discover_commands(project_root.as_deref());

    seed_session(&agent, &context, mode).await?;

    let soul = Soul::new(agent, bus.clone(), context, approvals, commands, false);
    let soul = Arc::new(tokio::sync::Mutex::new(soul));

    let server = RpcServer::new(std::io::stdout());
    let handler: Arc<LoomRpcHandler> = Arc::new(LoomRpcHandler::new(
        soul,
        session_id,
        PROTOCOL_VERSION.to_string(),
    ));

    // Forward every wire event onto the RPC transport as an `event`
    // notification so a connected client sees the full stream without
    // polling.
    {
        let server = server.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            while let Ok(envelope) = rx.recv().await {
                if let Ok(payload) = serde_json::to_value(&envelope) {
                    let _ = server.notify("event", payload);
                }
            }
        });
    }

    let reader = BufReader::new(stdin());
    server.serve(reader, handler).await;
    Ok(())
}

/// CLI flags win over file-layer and env-var config: they are the most
/// specific, most recently stated intent.
fn apply_cli_overrides(config: &mut loom_config::Config, cli: &Cli) {
    if cli.yolo {
        config.agent.yolo = true;
    }
    if let Some(n) = cli.max_steps_per_turn {
        config.agent.max_steps_per_turn = n;
    }
    if let Some(n) = cli.max_retries_per_step {
        config.agent.max_retries_per_step = n;
    }
    if let Some(n) = cli.max_ralph_iterations {
        config.agent.max_ralph_iterations = n;
    }
}

/// `--agent`/`--agent-file` replace the system prompt with a persona body.
/// Mutual exclusion is already enforced by clap's `conflicts_with`.
fn apply_agent_override(ctx: &mut RuntimeContext, cli: &Cli) -> anyhow::Result<()> {
    if let Some(name) = &cli.agent {
        let info = ctx
            .agents
            .get()
            .iter()
            .find(|a| &a.name == name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no agent persona named {name:?} was discovered"))?;
        ctx.system_prompt_override = Some(info.content.clone());
        return Ok(());
    }
    if let Some(path) = &cli.agent_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading --agent-file {}", path.display()))?;
        ctx.system_prompt_override = Some(strip_frontmatter(&raw).to_string());
    }
    Ok(())
}

/// Strip a leading `---\n...\n---\n` YAML frontmatter block, if present;
/// otherwise return the text unchanged. Mirrors `loom_runtime::agents`'s own
/// frontmatter convention without depending on its private parser.
fn strip_frontmatter(raw: &str) -> &str {
    let rest = raw.trim_start_matches('\n');
    let Some(after_open) = rest.strip_prefix("---") else {
        return rest;
    };
    match after_open.find("\n---") {
        Some(close) => after_open[close + 4..].trim_start_matches('\n'),
        None => rest,
    }
}

/// Parse every `*.md` file directly under `dir` as a skill and merge it
/// into the discovered skill set, beyond the standard search hierarchy.
fn merge_extra_skills(ctx: &mut RuntimeContext, dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!(dir = %dir.display(), "--skills-dir is not readable; ignoring");
        return;
    };
    let mut extra = ctx.skills.get();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Some(parsed) = loom_runtime::parse_skill_file(&raw) else {
            continue;
        };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("skill")
            .to_string();
        extra.push(loom_runtime::SkillInfo {
            command: stem.clone(),
            name: parsed.name.unwrap_or(stem),
            description: parsed.description,
            version: parsed.version,
            skill_md_path: path.clone(),
            skill_dir: dir.to_path_buf(),
            content: parsed.body,
            loom_meta: parsed.loom_meta,
        });
    }
    ctx.skills.set(extra);
}

/// Resolve the session id: `--session` wins, `--continue` picks the most
/// recently modified session directory under the share dir, otherwise a
/// fresh id is generated.
fn resolve_session_id(cli: &Cli) -> String {
    if let Some(id) = &cli.session {
        return id.clone();
    }
    if cli.continue_ {
        if let Some(latest) = most_recent_session_dir() {
            return latest;
        }
        tracing::warn!("--continue found no existing session; starting a new one");
    }
    uuid::Uuid::new_v4().to_string()
}

fn most_recent_session_dir() -> Option<String> {
    let sessions_root = loom_config::share_dir().join("sessions");
    let entries = std::fs::read_dir(&sessions_root).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .max_by_key(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
        .and_then(|e| e.file_name().into_string().ok())
}

/// Seed the live session's system message. A resumed session already has
/// its system message in the replayed `context.jsonl`; a fresh one needs it
/// pushed once, to both the durable log and the in-memory session.
async fn seed_session(
    agent: &loom_core::Agent,
    context: &ContextStore,
    mode: AgentMode,
) -> anyhow::Result<()> {
    let existing = context.snapshot().await;
    if existing.is_empty() {
        let system = agent.current_system_message(mode);
        context.append(system).await?;
    }
    Ok(())
}

fn init_logging(verbose: bool) {
    // stdout carries the JSON-RPC wire protocol; logging must never touch it.
    // Off by default, stderr only with --verbose, so a connected client never
    // has to filter log noise out of its framed stdout reader.
    if !verbose {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::OFF)
            .try_init();
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
