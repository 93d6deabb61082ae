//! `foreman agents` and `foreman doctor`: what is registered, and whether
//! it actually starts.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;

use foreman_core::Capability;
use foreman_core::registry::{AgentDescriptor, AgentRegistry, HealthStatus, Origin};

use crate::config::ForemanConfig;
use crate::runtime::Runtime;

/// How long `doctor` waits for one agent's handshake.
const DOCTOR_TIMEOUT: Duration = Duration::from_secs(60);

/// List every registered agent with its health.
pub fn run_agents(registry: &AgentRegistry) -> Result<()> {
    println!("{:<12} {:<16} {:<6} {:<9} HEALTH", "ID", "NAME", "PROTO", "ORIGIN");
    for descriptor in registry.iter() {
        println!(
            "{:<12} {:<16} {:<6} {:<9} {}",
            descriptor.id(),
            descriptor.display_name(),
            descriptor.protocol().to_string(),
            origin_label(descriptor),
            health_label(&descriptor.check_health()),
        );
        println!("  capabilities: {}", capability_list(descriptor));
    }
    Ok(())
}

/// Check configuration, then start every agent whose program is present
/// and report what it says about itself. Returns whether all were healthy.
pub async fn run_doctor(config: &ForemanConfig, runtime: &Runtime, workspace: &Path) -> Result<bool> {
    match &config.source {
        Some(path) => println!("Config: {}", path.display()),
        None => println!("Config: built-in defaults (no config file)"),
    }
    println!("Approvals: {:?}", config.approvals);
    println!("Workspace: {}", workspace.display());
    println!();

    let mut all_ok = true;
    for descriptor in runtime.registry.iter() {
        let health = descriptor.check_health();
        if let HealthStatus::Unavailable { reason } = &health {
            println!("[!] {}: {reason}", descriptor.id());
            all_ok = false;
            continue;
        }

        let harness = runtime.instantiate(descriptor);
        match tokio::time::timeout(DOCTOR_TIMEOUT, harness.ensure_ready(workspace)).await {
            Ok(Ok(info)) => println!("[+] {}: ready ({})", descriptor.id(), server_label(&info)),
            Ok(Err(e)) => {
                println!("[!] {}: {e}", descriptor.id());
                all_ok = false;
            }
            Err(_) => {
                println!("[!] {}: no handshake within {:?}", descriptor.id(), DOCTOR_TIMEOUT);
                all_ok = false;
            }
        }
    }

    let live = runtime.supervisor.snapshot();
    if !live.is_empty() {
        println!();
        println!("Sessions:");
        for session in &live {
            println!(
                "  {} pid={} state={:?} started={}",
                session.agent,
                session
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                session.state,
                session.created_at.format("%H:%M:%S"),
            );
        }
    }

    Ok(all_ok)
}

fn origin_label(descriptor: &AgentDescriptor) -> &'static str {
    match descriptor.origin() {
        Origin::BuiltIn => "built-in",
        Origin::Plugin => "plugin",
    }
}

fn health_label(health: &HealthStatus) -> String {
    match health {
        HealthStatus::Healthy { detail } => format!("ok ({detail})"),
        HealthStatus::Unavailable { reason } => format!("unavailable: {reason}"),
    }
}

fn capability_list(descriptor: &AgentDescriptor) -> String {
    descriptor
        .capabilities()
        .iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Best-effort one-liner from whatever the agent returned to `initialize`.
fn server_label(info: &Value) -> String {
    let codex = info.get("userAgent").and_then(Value::as_str);
    let acp = info
        .pointer("/agentInfo/name")
        .and_then(Value::as_str)
        .map(|name| match info.pointer("/agentInfo/version").and_then(Value::as_str) {
            Some(version) => format!("{name} {version}"),
            None => name.to_string(),
        });
    match (codex, acp) {
        (Some(agent), _) => agent.to_string(),
        (None, Some(agent)) => agent,
        (None, None) => match info.get("protocolVersion") {
            Some(version) => format!("protocol {version}"),
            None => "no server info".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_label_prefers_codex_user_agent() {
        assert_eq!(server_label(&json!({"userAgent": "codex/1.2"})), "codex/1.2");
    }

    #[test]
    fn server_label_reads_acp_agent_info() {
        let info = json!({"protocolVersion": 1, "agentInfo": {"name": "opencode", "version": "0.9"}});
        assert_eq!(server_label(&info), "opencode 0.9");
        assert_eq!(server_label(&json!({"protocolVersion": 1})), "protocol 1");
        assert_eq!(server_label(&Value::Null), "no server info");
    }

    #[test]
    fn capability_list_is_kebab_case() {
        let registry = AgentRegistry::with_builtins();
        let opencode = registry.resolve("opencode").unwrap();
        let list = capability_list(opencode);
        assert!(list.contains("turn-execution"), "got {list}");
        assert!(!list.contains("review"), "got {list}");
    }
}
