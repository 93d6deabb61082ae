//! Process-wide wiring shared by every command that talks to an agent:
//! the registry, one supervisor, its reaper and the approval responder.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use foreman_core::approval::{
    AcceptAll, ApprovalDecision, ApprovalResponder, ChannelResponder, DeclineAll, PendingApproval,
};
use foreman_core::harness::{Harness, HarnessContext};
use foreman_core::registry::AgentDescriptor;
use foreman_core::{AgentRegistry, Capability, Supervisor};

use crate::config::{ApprovalPolicy, ForemanConfig};

pub struct Runtime {
    pub registry: AgentRegistry,
    pub supervisor: Supervisor,
    ctx: HarnessContext,
    cancel: CancellationToken,
    reaper: JoinHandle<()>,
}

impl Runtime {
    /// Build the registry and start the supervisor's reaper.
    pub fn start(config: &ForemanConfig) -> Result<Self> {
        let registry = config.registry()?;
        let supervisor = Supervisor::new(config.supervisor.clone());
        let ctx = HarnessContext::new(supervisor.clone()).with_approvals(responder(config.approvals));
        let cancel = CancellationToken::new();
        let reaper = supervisor.spawn_reaper(cancel.clone());
        Ok(Self {
            registry,
            supervisor,
            ctx,
            cancel,
            reaper,
        })
    }

    /// A harness for `agent`, provided it declares `capability`.
    pub fn harness(&self, agent: &str, capability: Capability) -> Result<Arc<dyn Harness>> {
        let descriptor = self.registry.require(agent, capability)?;
        Ok(self.instantiate(descriptor))
    }

    pub fn instantiate(&self, descriptor: &AgentDescriptor) -> Arc<dyn Harness> {
        descriptor.instantiate(self.ctx.clone())
    }

    /// Stop the reaper and close every agent process.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.reaper.await.ok();
        self.supervisor.close_all().await;
    }
}

/// The workspace argument, defaulting to the current directory.
pub fn workspace_or_cwd(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("failed to determine current directory"),
    }
}

fn responder(policy: ApprovalPolicy) -> Arc<dyn ApprovalResponder> {
    match policy {
        ApprovalPolicy::Decline => Arc::new(DeclineAll),
        ApprovalPolicy::Accept => Arc::new(AcceptAll),
        ApprovalPolicy::Prompt => {
            let (responder, mut requests) = ChannelResponder::new(1);
            tokio::spawn(async move {
                let mut stdin = BufReader::new(tokio::io::stdin()).lines();
                while let Some(pending) = requests.recv().await {
                    ask(&mut stdin, pending).await;
                }
            });
            Arc::new(responder)
        }
    }
}

/// Ask on the terminal. Anything but "y"/"yes" declines, and so does EOF.
async fn ask<R>(stdin: &mut tokio::io::Lines<R>, pending: PendingApproval)
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let request = &pending.request;
    eprintln!();
    eprintln!("[{}] approval requested ({:?})", request.agent, request.kind);
    eprintln!("  {}", request.summary);
    eprint!("Allow? [y/N] ");

    let answer = stdin.next_line().await.ok().flatten().unwrap_or_default();
    let decision = match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ApprovalDecision::Accept,
        _ => ApprovalDecision::Decline,
    };
    // The turn may already be gone; nothing to do then.
    let _ = pending.reply.send(decision);
}
