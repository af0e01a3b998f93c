// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Skill discovery and parsing for skill package trees.
//!
//! ## Skill packages
//!
//! A skill is a **directory** that contains a `SKILL.md` file.  Subdirectories
//! of a skill package that also contain `SKILL.md` files are **sub-skills** and
//! are discovered automatically — no frontmatter declaration is needed.
//!
//! Example layout:
//! ```text
//! .loom/skills/
//! ├── loom/
//! │   ├── SKILL.md          → slash command: /loom
//! │   ├── scripts/          → bundled scripts (not a sub-skill — no SKILL.md)
//! │   ├── plan/
//! │   │   └── SKILL.md      → slash command: /loom/plan
//! │   ├── implement/
//! │   │   ├── SKILL.md      → slash command: /loom/implement
//! │   │   └── research/
//! │   │       └── SKILL.md  → slash command: /loom/implement/research
//! │   └── review/
//! │       └── SKILL.md      → slash command: /loom/review
//! └── git-workflow/
//!     └── SKILL.md          → slash command: /git-workflow
//! ```
//!
//! Each skill in the tree has a unique **command** string derived from its path
//! relative to the skills root (e.g. `"loom/plan"`).  Commands are the keys
//! used with the `load_skill` tool.
//!
//! ## Discovery order (later sources take precedence on command collision)
//!
//! Discovery uses a **unified ancestor walk**: two chains are collected —
//! one from the project root (or CWD) up to `/`, one from `~` up to `/` —
//! deduplicated and sorted by depth (shallowest = lowest precedence).  At
//! every directory in the merged chain, four config dirs are checked in order:
//!
//! ```text
//! <dir>/.agents/skills/   (lowest within a level)
//! <dir>/.claude/skills/
//! <dir>/.codex/skills/
//! <dir>/.cursor/skills/
//! <dir>/.loom/skills/     (highest within a level)
//! ```
//!
//! Because the chain runs from `/` down to the project root, entries closer to
//! the project root always override farther ancestors.  In practice:
//!
//! - `~/.cursor/skills/`      — found because home is one of the walk roots
//! - `/workspace/.cursor/skills/` — found when the git root is a subdirectory
//!   of the workspace, even though the workspace has no `.git`
//! - `<project>/.loom/skills/` — highest precedence of all
//!
//! The `SKILL.md` filename is matched case-insensitively, so `skill.md`,
//! `Skill.md`, and `SKILL.md` are all accepted.
//!
//! ## SKILL.md format
//!
//! ```markdown
//! ---
//! description: |
//!   This skill should be used when the user asks to "do X", "configure Y".
//! name: My Skill       # optional — falls back to directory name
//! version: 0.1.0       # optional
//! loom:                # optional loom-specific block
//!   always: false
//!   requires_bins: [ffmpeg]
//!   requires_env: [API_KEY]
//!   user_invocable_only: false
//! ---
//!
//! # Skill body here…
//! ```

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::shared::Shared;

// ── Public types ──────────────────────────────────────────────────────────────

/// Loom-specific metadata block parsed from the `loom:` key in frontmatter.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoomSkillMeta {
    /// Always include this skill's metadata in the system prompt, regardless
    /// of token budget or availability checks.
    #[serde(default)]
    pub always: bool,

    /// Names of binaries that must exist (`which <bin>`) for this skill to be
    /// included.  If any binary is absent the skill is silently skipped.
    #[serde(default)]
    pub requires_bins: Vec<String>,

    /// Names of environment variables that must be set for this skill to be
    /// included.  If any variable is unset the skill is silently skipped.
    #[serde(default)]
    pub requires_env: Vec<String>,

    /// When `true` the skill is excluded from the model's `<available_skills>`
    /// list but still registered as a TUI slash command.  Useful for skills
    /// that should only be invoked explicitly by the user.
    #[serde(default)]
    pub user_invocable_only: bool,
}

/// A fully parsed and validated skill.
#[derive(Debug, Clone)]
pub struct SkillInfo {
    /// Slash-command key derived from the directory path relative to the skills
    /// root.  Top-level skills use the directory name (e.g. `"loom"`); nested
    /// skills use `/`-separated segments (e.g. `"loom/plan"`).  This is the
    /// value passed to `load_skill(command)`.
    pub command: String,
    /// Human-readable display name.  Comes from the `name:` frontmatter field;
    /// falls back to the last segment of `command` when not set.
    pub name: String,
    /// Description from frontmatter (should contain trigger phrases).
    pub description: String,
    /// Optional semver version string.
    pub version: Option<String>,
    /// Absolute path to the `SKILL.md` file.
    pub skill_md_path: PathBuf,
    /// Absolute path to the skill directory (parent of `SKILL.md`).
    pub skill_dir: PathBuf,
    /// SKILL.md body — everything after the closing `---` fence.
    pub content: String,
    /// Optional loom-specific metadata.
    pub loom_meta: Option<LoomSkillMeta>,
}

/// A shared, live-refreshable collection of discovered skills.
///
/// Both the TUI command registry and the running agent hold a clone of the same
/// `SharedSkills` instance.  Calling [`SharedSkills::refresh`] atomically
/// replaces the inner skill slice so the next agent turn and the next TUI
/// command lookup both see the updated skills without restarting.
pub type SharedSkills = Shared<SkillInfo>;

impl Shared<SkillInfo> {
    /// Re-run skill discovery and atomically replace the skill list.
    ///
    /// Callers (e.g. the `/refresh` slash command) should also rebuild any
    /// derived state such as TUI slash commands after calling this.
    pub fn refresh(&self, project_root: Option<&Path>) {
        self.set(discover_skills(project_root));
    }
}

// ── Internal frontmatter schema ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawFrontmatter {
    /// Optional display name; falls back to the directory name when omitted.
    #[serde(default)]
    name: Option<String>,
    description: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    loom: Option<LoomSkillMeta>,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parsed frontmatter fields plus the SKILL.md body.
pub struct ParsedSkill {
    /// Optional display name from frontmatter.
    pub name: Option<String>,
    pub description: String,
    pub version: Option<String>,
    pub loom_meta: Option<LoomSkillMeta>,
    /// Everything after the closing `---` fence, with leading whitespace trimmed.
    pub body: String,
}

/// Parse a raw SKILL.md string into its frontmatter fields and body.
///
/// The `description` field is required.  The `name` field is optional; callers
/// should fall back to the directory name when it is absent.
///
/// Returns `None` when the frontmatter is missing, malformed, or lacks a
/// non-empty `description`.
#[must_use]
pub fn parse_skill_file(raw: &str) -> Option<ParsedSkill> {
    let rest = raw.trim_start_matches('\n');

    // ── Frontmatter path ─────────────────────────────────────────────────────
    if let Some(after_open) = rest.strip_prefix("---") {
        let close = after_open.find("\n---")?;
        let yaml_block = &after_open[..close];
        // Body starts after "\n---" (4 bytes). Strip one leading newline if present.
        let body = after_open[close + 4..].trim_start_matches('\n').to_string();

        let fm: RawFrontmatter = serde_yaml::from_str(yaml_block).ok()?;

        if fm.description.trim().is_empty() {
            return None;
        }

        return Some(ParsedSkill {
            name: fm.name.filter(|n| !n.trim().is_empty()),
            description: fm.description,
            version: fm.version,
            loom_meta: fm.loom,
            body,
        });
    }

    // ── Frontmatter-free path ─────────────────────────────────────────────────
    // A SKILL.md with no `---` fence is accepted as a plain-markdown skill.
    // The description is synthesised from the first non-empty, non-heading line
    // (or from the text of the first `# Heading` if no plain line comes first).
    // The entire file becomes the body.
    if rest.trim().is_empty() {
        return None;
    }

    let description = rest
        .lines()
        .find_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            // Strip a leading `#` heading marker so "# Loom" → "Loom".
            let text = line.trim_start_matches('#').trim();
            if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            }
        })
        .unwrap_or_else(|| "Skill".to_string());

    Some(ParsedSkill {
        name: None,
        description,
        version: None,
        loom_meta: None,
        body: rest.to_string(),
    })
}

// ── Requirements checking ─────────────────────────────────────────────────────

/// Return `true` when all `requires_bins` entries can be found on `PATH`.
fn bins_available(bins: &[String]) -> bool {
    bins.iter().all(|bin| which_available(bin))
}

fn which_available(name: &str) -> bool {
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            if PathBuf::from(dir).join(name).exists() {
                return true;
            }
        }
    }
    false
}

/// Return `true` when all `requires_env` entries are set (non-empty).
fn env_vars_set(vars: &[String]) -> bool {
    vars.iter()
        .all(|v| std::env::var(v).map(|s| !s.is_empty()).unwrap_or(false))
}

// ── Directory scanning ────────────────────────────────────────────────────────

pub(crate) const MAX_SKILL_FILE_BYTES: u64 = 256 * 1024; // 256 KB

/// Compute the slash-command key for `skill_dir` relative to the skills `root`.
///
/// Path separators are normalised to `/` and each component is kept as-is
/// (caller is responsible for sanitising component names if needed).
fn command_from_path(root: &Path, skill_dir: &Path) -> String {
    skill_dir
        .strip_prefix(root)
        .unwrap_or(skill_dir)
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Try to load and validate one skill directory.
///
/// Returns `None` and emits a warning when the file is oversized, unreadable,
/// or has invalid frontmatter.
fn try_load_skill(
    skill_dir: &Path,
    skill_md: &Path,
    command: &str,
    source: &str,
) -> Option<SkillInfo> {
    let size = skill_md.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_SKILL_FILE_BYTES {
        warn!(
            source,
            path = %skill_md.display(),
            size,
            max = MAX_SKILL_FILE_BYTES,
            "skipping oversized SKILL.md"
        );
        return None;
    }

    let raw = match std::fs::read_to_string(skill_md) {
        Ok(s) => s,
        Err(e) => {
            warn!(source, path = %skill_md.display(), error = %e, "failed to read SKILL.md");
            return None;
        }
    };

    let parsed = match parse_skill_file(&raw) {
        Some(p) => p,
        None => {
            warn!(source, path = %skill_md.display(), "failed to parse SKILL.md frontmatter — skipping");
            return None;
        }
    };

    // Check runtime requirements before accepting the skill.
    if let Some(ref meta) = parsed.loom_meta {
        if !bins_available(&meta.requires_bins) {
            return None;
        }
        if !env_vars_set(&meta.requires_env) {
            return None;
        }
    }

    // Display name: frontmatter `name:` if provided, otherwise the last
    // path segment (directory name) of `command`.
    let name = parsed
        .name
        .unwrap_or_else(|| command.rsplit('/').next().unwrap_or(command).to_string());

    Some(SkillInfo {
        command: command.to_string(),
        name,
        description: parsed.description,
        version: parsed.version,
        skill_md_path: skill_md.to_path_buf(),
        skill_dir: skill_dir.to_path_buf(),
        content: parsed.body,
        loom_meta: parsed.loom_meta,
    })
}

/// Recursively scan `dir` under `root` for skill packages.
///
/// Any subdirectory (at any depth) that contains a `SKILL.md` file is
/// considered a skill.  Subdirectories without `SKILL.md` are still traversed
/// so that nested sub-skills can be discovered; they are simply not registered
/// as skills themselves.
/// Find the `SKILL.md` file inside `dir`, accepting any capitalisation.
///
/// Checks for the canonical `SKILL.md` first (fast path), then falls back to a
/// case-insensitive scan of the directory entries so that `skill.md`, `Skill.md`,
/// etc. are also accepted.
fn find_skill_md(dir: &Path) -> Option<PathBuf> {
    let canonical = dir.join("SKILL.md");
    if canonical.is_file() {
        return Some(canonical);
    }
    std::fs::read_dir(dir).ok()?.flatten().find_map(|e| {
        let p = e.path();
        if p.is_file()
            && p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_lowercase() == "skill.md")
                .unwrap_or(false)
        {
            Some(p)
        } else {
            None
        }
    })
}

fn scan_recursive(root: &Path, dir: &Path, source: &str, out: &mut Vec<SkillInfo>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let child = entry.path();
        if !child.is_dir() {
            continue;
        }

        if let Some(skill_md) = find_skill_md(&child) {
            let command = command_from_path(root, &child);
            if let Some(skill) = try_load_skill(&child, &skill_md, &command, source) {
                out.push(skill);
            }
        }

        // Recurse unconditionally — a skill directory may have sub-skill
        // subdirectories even if no SKILL.md exists at this level.
        scan_recursive(root, &child, source, out);
    }
}

/// Scan one skills root directory and return all valid skills found within it
/// (including those nested at any depth).
fn scan_skills_dir(dir: &Path, source: &str) -> Vec<SkillInfo> {
    let mut skills = Vec::new();
    scan_recursive(dir, dir, source, &mut skills);
    skills
}

// ── Public discovery API ──────────────────────────────────────────────────────

/// Walk up the filesystem from `start` to `/`, collecting every directory.
///
/// Returns the directories in **root-first** order so callers can load them
/// lowest-precedence first.
pub(crate) fn ancestor_chain(start: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut cur = start.to_path_buf();
    loop {
        dirs.push(cur.clone());
        match cur.parent() {
            Some(p) if p != cur => cur = p.to_path_buf(),
            _ => break,
        }
    }
    dirs.reverse(); // root first, start last
    dirs
}

/// Build the merged, depth-sorted list of directories to scan for config files.
///
/// Combines the ancestor chains of `project_root` (or CWD) and `~`, deduplicates,
/// and returns them shallowest-first so that deeper directories (closer to the
/// project root) always win on command name collisions.
pub(crate) fn build_sorted_search_dirs(project_root: Option<&Path>) -> Vec<PathBuf> {
    let home = dirs::home_dir();
    let base = project_root
        .map(|p| p.to_path_buf())
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));

    let mut all_dirs: std::collections::HashSet<PathBuf> = std::collections::HashSet::new();
    for dir in ancestor_chain(&base) {
        all_dirs.insert(dir);
    }
    if let Some(ref h) = home {
        for dir in ancestor_chain(h) {
            all_dirs.insert(dir);
        }
    }

    let mut sorted: Vec<PathBuf> = all_dirs.into_iter().collect();
    sorted.sort_by(|a, b| {
        let da = a.components().count();
        let db = b.components().count();
        da.cmp(&db).then_with(|| a.cmp(b))
    });
    sorted
}

/// Derive the slash-command key for a `*.md` `path` relative to `root`.
///
/// The extension (`.md` / `.MD`) is stripped; path components are joined with
/// `/`.  Used by both command and agent discovery.
pub(crate) fn md_key_from_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let raw: String = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    raw.strip_suffix(".md")
        .or_else(|| raw.strip_suffix(".MD"))
        .map(|s| s.to_string())
        .unwrap_or(raw)
}

/// Recursively enumerate all `*.md` files under `dir`, returning
/// `(key, path)` pairs where `key` is the path relative to `root` with the
/// `.md` extension stripped.
///
/// Files are yielded in deterministic (sorted) order.  Both command discovery
/// and agent discovery use this helper so the scanning logic is implemented
/// exactly once.
pub(crate) fn enumerate_md_files_recursive(root: &Path, dir: &Path) -> Vec<(String, PathBuf)> {
    let mut out = Vec::new();
    enumerate_md_inner(root, dir, &mut out);
    out
}

fn enumerate_md_inner(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = entries.flatten().collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.is_file() {
            let is_md = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("md"))
                .unwrap_or(false);
            if is_md {
                out.push((md_key_from_path(root, &path), path));
            }
        } else if path.is_dir() {
            enumerate_md_inner(root, &path, out);
        }
    }
}

/// Discover all skills from the standard search hierarchy.
///
/// The search is a **unified ancestor walk**: every directory in the path from
/// `/` down to the project root (and from `/` down to `~`) is checked for
/// `.agents/skills/`, `.claude/skills/`, `.codex/skills/`, `.cursor/skills/`,
/// and `.loom/skills/` (in that order within each directory, so `.loom/` beats
/// `.cursor/` at the same level).  Because directories are loaded farthest-first, entries closer
/// to the project root override entries from parent directories.
///
/// This means:
/// - `/home/user/.cursor/skills/` is found because home is one of the walk roots.
/// - `/data/.cursor/skills/` is found when the project root is a subdirectory
///   of `/data/` (e.g. `/data/repo/`), even though `/data/` has no `.git`.
/// - Skills at the project root itself always have the highest precedence.
///
/// When `project_root` is `None`, the current working directory is used as the
/// walk base so workspace-level skills are still found.
#[must_use]
pub fn discover_skills(project_root: Option<&Path>) -> Vec<SkillInfo> {
    // Keyed by command; later insertions (higher-precedence sources) win.
    let mut map: HashMap<String, SkillInfo> = HashMap::new();

    let mut load = |dir: PathBuf, source: &str| {
        for skill in scan_skills_dir(&dir, source) {
            map.insert(skill.command.clone(), skill);
        }
    };

    // At each directory, load all five config dir types.  The within-level
    // order (.agents < .claude < .codex < .cursor < .loom) means .loom/ wins
    // on collision at the same directory depth.  .codex/ is included for
    // compatibility with Codex-based tooling (mirrors Cursor's compat list).
    for dir in &build_sorted_search_dirs(project_root) {
        let label = dir.to_string_lossy();
        load(
            dir.join(".agents").join("skills"),
            &format!("{label}/.agents"),
        );
        load(
            dir.join(".claude").join("skills"),
            &format!("{label}/.claude"),
        );
        load(
            dir.join(".codex").join("skills"),
            &format!("{label}/.codex"),
        );
        load(
            dir.join(".cursor").join("skills"),
            &format!("{label}/.cursor"),
        );
        load(dir.join(".loom").join("skills"), &format!("{label}/.loom"));
    }

    let mut result: Vec<SkillInfo> = map.into_values().collect();
    result.sort_by(|a, b| a.command.cmp(&b.command));
    result
}

// ── Command discovery (`.cursor/commands/` etc.) ──────────────────────────────

/// Try to load one command markdown file.
///
/// Returns `None` when the file is oversized, unreadable, or produces no
/// usable content.
fn try_load_command(md_path: &Path, command: &str, source: &str) -> Option<SkillInfo> {
    let size = md_path.metadata().map(|m| m.len()).unwrap_or(0);
    if size > MAX_SKILL_FILE_BYTES {
        warn!(
            source,
            path = %md_path.display(),
            size,
            max = MAX_SKILL_FILE_BYTES,
            "skipping oversized command file"
        );
        return None;
    }

    let raw = match std::fs::read_to_string(md_path) {
        Ok(s) => s,
        Err(e) => {
            warn!(source, path = %md_path.display(), error = %e, "failed to read command file");
            return None;
        }
    };

    let parsed = match parse_skill_file(&raw) {
        Some(p) => p,
        None => {
            warn!(source, path = %md_path.display(), "could not extract content from command file — skipping");
            return None;
        }
    };

    let name = parsed
        .name
        .unwrap_or_else(|| command.rsplit('/').next().unwrap_or(command).to_string());

    Some(SkillInfo {
        command: command.to_string(),
        name,
        description: parsed.description,
        version: parsed.version,
        skill_md_path: md_path.to_path_buf(),
        skill_dir: md_path.parent().unwrap_or(md_path).to_path_buf(),
        content: parsed.body,
        loom_meta: parsed.loom_meta,
    })
}

/// Scan one commands root directory and return all valid commands found within
/// it (including those nested at any depth).
fn scan_commands_dir(dir: &Path, source: &str) -> Vec<SkillInfo> {
    enumerate_md_files_recursive(dir, dir)
        .into_iter()
        .filter_map(|(key, path)| try_load_command(&path, &key, source))
        .collect()
}

/// Discover user-invocable commands from the standard `commands/` directories.
///
/// Uses the same ancestor-walk strategy as [`discover_skills`] but scans
/// `commands/` subdirectories instead of `skills/`.  Each `.md` file found
/// inside a `commands/` directory becomes one slash command whose name is the
/// file path relative to the commands root with the `.md` extension removed.
/// Hyphens in filenames are preserved (`review-code.md` → `/review-code`),
/// matching the Cursor commands convention.
///
/// Scanned config directories (lowest to highest precedence within a level):
///
/// ```text
/// <dir>/.agents/commands/
/// <dir>/.claude/commands/
/// <dir>/.codex/commands/
/// <dir>/.cursor/commands/   ← primary Cursor location
/// <dir>/.loom/commands/     ← highest precedence
/// ```
///
/// Example layout:
/// ```text
/// .cursor/commands/
/// ├── implement.md           → slash command `/implement`
/// ├── review-code.md         → slash command `/review-code`
/// └── loom/
///     ├── plan.md            → slash command `/loom/plan`
///     └── task-makefile.md   → slash command `/loom/task-makefile`
/// ```
///
/// Discovery priority mirrors skill discovery: entries closer to the project
/// root override those from parent directories.
#[must_use]
pub fn discover_commands(project_root: Option<&Path>) -> Vec<SkillInfo> {
    let mut map: HashMap<String, SkillInfo> = HashMap::new();

    let mut load = |dir: PathBuf, source: &str| {
        for cmd in scan_commands_dir(&dir, source) {
            map.insert(cmd.command.clone(), cmd);
        }
    };

    for dir in &build_sorted_search_dirs(project_root) {
        let label = dir.to_string_lossy();
        load(
            dir.join(".agents").join("commands"),
            &format!("{label}/.agents"),
        );
        load(
            dir.join(".claude").join("commands"),
            &format!("{label}/.claude"),
        );
        load(
            dir.join(".codex").join("commands"),
            &format!("{label}/.codex"),
        );
        load(
            dir.join(".cursor").join("commands"),
            &format!("{label}/.cursor"),
        );
        load(
            dir.join(".loom").join("commands"),
            &format!("{label}/.loom"),
        );
    }

    let mut result: Vec<SkillInfo> = map.into_values().collect();
    result.sort_by(|a, b| a.command.cmp(&b.command));
    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────
