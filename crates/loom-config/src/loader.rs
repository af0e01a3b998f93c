// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority.  Later files override earlier ones.  Each location is checked
/// for both the canonical `config.toml` and, for backward compatibility, a
/// legacy `config.json` — the JSON form is deprecated but still read so
/// pre-existing installations keep working until they re-save.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/loom/config.toml"));
    paths.push(PathBuf::from("/etc/loom/config.json"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/loom/config.toml"));
        paths.push(home.join(".config/loom/config.json"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("loom/config.toml"));
        paths.push(cfg.join("loom/config.json"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".loom/config.toml"));
    paths.push(PathBuf::from(".loom/config.json"));
    paths.push(PathBuf::from(".loom.toml"));
    paths.push(PathBuf::from("loom.toml"));

    paths
}

/// Load configuration by merging all discovered config layers.
/// The `extra` argument may provide an explicit path (e.g. `--config-file` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = toml::Value::Table(toml::Table::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let layer = read_layer(&path)?;
            merge_toml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_layer(p)?;
        merge_toml(&mut merged, layer);
    }

    // Deserialize the merged value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let mut config: Config = if matches!(merged, toml::Value::Table(ref t) if t.is_empty()) {
        Config::default()
    } else {
        merged.try_into().unwrap_or_default()
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// The root directory under which per-session state (`sessions/<id>/`) and
/// session-scoped metadata (`kimi.json`) are persisted.
///
/// Resolution order:
/// 1. `LOOM_HOME`, if set — used verbatim, so a caller can point an entire
///    run at a scratch directory (tests, containers).
/// 2. `dirs::data_dir()/loom` (XDG `$XDG_DATA_HOME` on Linux) — distinct
///    from the XDG *config* directory `config_search_paths()` reads
///    `config.toml` from; data and config are different concerns even
///    though both happen to live under the same vendor directory name.
/// 3. `./.loom` relative to the current directory, if neither of the above
///    is available (e.g. `dirs::data_dir()` returns `None`).
pub fn share_dir() -> PathBuf {
    if let Ok(over) = std::env::var("LOOM_HOME") {
        if !over.is_empty() {
            return PathBuf::from(over);
        }
    }
    match dirs::data_dir() {
        Some(data) => data.join("loom"),
        None => PathBuf::from(".loom"),
    }
}

/// Environment variables applied on top of the merged file config.
///
/// Unlike the file-layer precedence above (last file silently wins),
/// a malformed env value here is treated as a user error: the caller asked
/// for a specific override and typoed it, so failing loudly beats silently
/// falling back to whatever the file layers already resolved to.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Ok(v) = std::env::var("LOOM_MODEL") {
        if !v.is_empty() {
            if let Some((provider, name)) = v.split_once('/') {
                config.model.provider = provider.to_string();
                config.model.name = name.to_string();
            } else {
                config.model.name = v;
            }
        }
    }
    if let Ok(v) = std::env::var("LOOM_YOLO") {
        config.agent.yolo = parse_env_bool("LOOM_YOLO", &v)?;
    }
    if let Ok(v) = std::env::var("LOOM_MAX_STEPS_PER_TURN") {
        config.agent.max_steps_per_turn = parse_env_u32("LOOM_MAX_STEPS_PER_TURN", &v)?;
    }
    if let Ok(v) = std::env::var("LOOM_MAX_RETRIES_PER_STEP") {
        config.agent.max_retries_per_step = parse_env_u32("LOOM_MAX_RETRIES_PER_STEP", &v)?;
    }
    if let Ok(v) = std::env::var("LOOM_MAX_RALPH_ITERATIONS") {
        config.agent.max_ralph_iterations = parse_env_u32("LOOM_MAX_RALPH_ITERATIONS", &v)?;
    }
    Ok(())
}

fn parse_env_bool(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{name}: invalid boolean value {other:?} (expected true/false)"),
    }
}

fn parse_env_u32(name: &str, raw: &str) -> anyhow::Result<u32> {
    raw.trim()
        .parse::<u32>()
        .with_context(|| format!("{name}: invalid integer value {raw:?}"))
}

/// Read one config layer, dispatching on extension.  `.json` layers are
/// parsed as JSON and converted into an equivalent TOML value; everything
/// else is parsed as TOML.
fn read_layer(path: &Path) -> anyhow::Result<toml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        warn!(
            path = %path.display(),
            "config.json is a legacy format; migrate to config.toml"
        );
        let json: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(json_to_toml(json))
    } else {
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Convert a `serde_json::Value` into the structurally-closest `toml::Value`.
/// TOML has no null; a JSON `null` is dropped from the surrounding table
/// (falling through to whatever default the schema provides) rather than
/// causing a conversion error.
fn json_to_toml(v: serde_json::Value) -> toml::Value {
    match v {
        serde_json::Value::Null => toml::Value::Table(toml::Table::new()),
        serde_json::Value::Bool(b) => toml::Value::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                toml::Value::Integer(i)
            } else {
                toml::Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => toml::Value::String(s),
        serde_json::Value::Array(a) => {
            toml::Value::Array(a.into_iter().map(json_to_toml).collect())
        }
        serde_json::Value::Object(o) => {
            let mut table = toml::Table::new();
            for (k, v) in o {
                if matches!(v, serde_json::Value::Null) {
                    continue;
                }
                table.insert(k, json_to_toml(v));
            }
            toml::Value::Table(table)
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_toml(dst: &mut toml::Value, src: toml::Value) {
    match (dst, src) {
        (toml::Value::Table(d), toml::Value::Table(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(toml::Value::Table(toml::Table::new()));
                merge_toml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
