//! Typed configuration values consumed by the core.
//!
//! Locating and layering configuration files is the binary's job; the core
//! only defines the shapes and their defaults.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::Capability;

/// Resource bounds and timing for the [`crate::supervisor::Supervisor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Idle sessions older than this are evicted by the sweep.
    pub idle_ttl_secs: u64,
    /// Upper bound on live sessions before count-pressure eviction kicks in.
    pub max_sessions: usize,
    /// How often the background reaper runs the eviction sweep.
    pub sweep_interval_secs: u64,
    /// Deadline applied to ordinary requests (not to turn execution).
    pub request_timeout_secs: u64,
    /// Deadline for the `initialize` exchange.
    pub handshake_timeout_secs: u64,
    /// Time between SIGTERM and SIGKILL when closing an agent process.
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 600,
            max_sessions: 8,
            sweep_interval_secs: 30,
            request_timeout_secs: 120,
            handshake_timeout_secs: 30,
            shutdown_grace_secs: 5,
        }
    }
}

impl SupervisorConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// How to start one agent process. Treated as opaque: the core never
/// interprets agent-specific flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Build a spec from an argv vector (`command = ["codex", "app-server"]`).
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("agent command must not be empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: BTreeMap::new(),
        })
    }

    /// Resolve the program against `PATH` without running anything.
    pub fn resolve_program(&self) -> Option<std::path::PathBuf> {
        let program = Path::new(&self.program);
        if program.components().count() > 1 {
            return program.is_file().then(|| program.to_path_buf());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    }
}

/// Wire protocol spoken by an agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// `codex app-server` JSON-RPC dialect.
    Codex,
    /// Agent Client Protocol, as spoken by `opencode acp`.
    Acp,
}

impl std::fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolFamily::Codex => write!(f, "codex"),
            ProtocolFamily::Acp => write!(f, "acp"),
        }
    }
}

/// One `[agents.<id>]` table.
///
/// For a built-in id this only overrides the launch command and
/// environment. For any other id it declares a plugin agent, which must
/// name the protocol family it speaks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentManifest {
    pub protocol: Option<ProtocolFamily>,
    pub display_name: Option<String>,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub capabilities: Option<BTreeSet<Capability>>,
}

impl AgentManifest {
    /// Launch spec for this manifest, or `None` when no command was given.
    pub fn launch_spec(&self) -> Result<Option<LaunchSpec>> {
        if self.command.is_empty() {
            return Ok(None);
        }
        let mut spec = LaunchSpec::from_argv(&self.command)?;
        spec.env.extend(self.env.clone());
        Ok(Some(spec))
    }
}
