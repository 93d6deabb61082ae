//! Configuration file management for foreman.
//!
//! Provides a TOML config file at `~/.config/foreman/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use foreman_core::AgentRegistry;
use foreman_core::config::{AgentManifest, SupervisorConfig};

/// Env var naming an alternate config file.
pub const CONFIG_ENV: &str = "FOREMAN_CONFIG";
/// Env var overriding the approval policy.
pub const APPROVALS_ENV: &str = "FOREMAN_APPROVALS";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// How the CLI answers approval requests raised during a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalPolicy {
    /// Decline every request.
    #[default]
    Decline,
    /// Accept every request.
    Accept,
    /// Ask on the terminal.
    Prompt,
}

impl std::str::FromStr for ApprovalPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "decline" => Ok(Self::Decline),
            "accept" => Ok(Self::Accept),
            "prompt" => Ok(Self::Prompt),
            other => bail!("unknown approval policy {other:?} (expected decline, accept or prompt)"),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub approvals: Option<ApprovalPolicy>,
    pub supervisor: SupervisorConfig,
    pub agents: BTreeMap<String, AgentManifest>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or
/// `~/.config/foreman`, on macOS too.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the default config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Which config file to use, and whether the user asked for it explicitly.
fn select_path(cli_path: Option<&Path>) -> (PathBuf, bool) {
    if let Some(path) = cli_path {
        return (path.to_path_buf(), true);
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => (PathBuf::from(path), true),
        _ => (config_path(), false),
    }
}

/// The file `foreman init` writes: `cli_path` > `FOREMAN_CONFIG` > default.
pub fn init_target(cli_path: Option<&Path>) -> PathBuf {
    select_path(cli_path).0
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Commented starting point written by `foreman init`.
pub const DEFAULT_CONFIG: &str = r#"# foreman configuration

# How approval requests are answered during `foreman run` and
# `foreman review`: "decline", "accept" or "prompt".
approvals = "decline"

[supervisor]
# Idle agent processes older than this are shut down.
idle_ttl_secs = 600
# Live agent processes before the oldest idle one is evicted.
max_sessions = 8
sweep_interval_secs = 30
request_timeout_secs = 120
handshake_timeout_secs = 30
# Seconds between SIGTERM and SIGKILL.
shutdown_grace_secs = 5

# Override a built-in agent's launch command:
#
# [agents.codex]
# command = ["codex", "app-server"]
#
# Declare a plugin agent speaking one of the built-in protocols
# ("codex" or "acp"):
#
# [agents.myagent]
# protocol = "acp"
# display_name = "My Agent"
# command = ["myagent", "--acp"]
# capabilities = ["turn-execution", "event-streaming", "approvals"]
# [agents.myagent.env]
# MYAGENT_LOG = "debug"
"#;

/// Write [`DEFAULT_CONFIG`] to `path`, creating parent dirs as needed.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ForemanConfig {
    /// The file that was read, if any.
    pub source: Option<PathBuf>,
    pub approvals: ApprovalPolicy,
    pub supervisor: SupervisorConfig,
    pub agents: BTreeMap<String, AgentManifest>,
}

impl ForemanConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - File: `cli_path` > `FOREMAN_CONFIG` > `~/.config/foreman/config.toml`.
    ///   An explicitly named file must exist; the default one may be absent.
    /// - Approvals: `cli_approvals` > `FOREMAN_APPROVALS` > file > decline.
    pub fn resolve(cli_path: Option<&Path>, cli_approvals: Option<ApprovalPolicy>) -> Result<Self> {
        let (path, explicit) = select_path(cli_path);
        let (file, source) = if explicit || path.exists() {
            (load_config(&path)?, Some(path))
        } else {
            (ConfigFile::default(), None)
        };

        let approvals = if let Some(policy) = cli_approvals {
            policy
        } else if let Ok(raw) = std::env::var(APPROVALS_ENV) {
            raw.parse::<ApprovalPolicy>()
                .with_context(|| format!("{APPROVALS_ENV} env var is not a valid policy"))?
        } else {
            file.approvals.unwrap_or_default()
        };

        Ok(Self {
            source,
            approvals,
            supervisor: file.supervisor,
            agents: file.agents,
        })
    }

    /// Built-in agents plus the plugins declared in the file.
    pub fn registry(&self) -> Result<AgentRegistry> {
        AgentRegistry::from_manifests(&self.agents).context("invalid [agents] configuration")
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
