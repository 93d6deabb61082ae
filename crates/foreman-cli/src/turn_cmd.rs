//! `foreman run` and `foreman review`: start a turn and stream its
//! canonical events to stdout, one JSON object per line.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foreman_core::Capability;
use foreman_core::harness::{
    ConversationOptions, ConversationRef, Harness, ReviewRequest, ReviewTarget, TurnHandle,
    TurnRequest,
};
use foreman_core::normalize::{CanonicalEvent, CanonicalKind, normalize_stream};

use crate::runtime::Runtime;

pub struct RunOptions {
    pub prompt: String,
    /// Resume this conversation instead of starting a new one.
    pub conversation: Option<String>,
    pub model: Option<String>,
    pub effort: Option<String>,
}

pub async fn run_turn(runtime: &Runtime, agent: &str, workspace: &Path, options: RunOptions) -> Result<()> {
    let harness = runtime.harness(agent, Capability::TurnExecution)?;
    let conversation = open_conversation(
        runtime,
        harness.as_ref(),
        workspace,
        options.conversation.as_deref(),
        options.model.clone(),
    )
    .await?;

    let request = TurnRequest {
        model: options.model,
        effort: options.effort,
        ..TurnRequest::new(conversation, options.prompt)
    };
    let handle = harness
        .start_turn(workspace, &request)
        .await
        .context("failed to start turn")?;
    drain(harness.as_ref(), workspace, handle).await
}

pub async fn run_review(
    runtime: &Runtime,
    agent: &str,
    workspace: &Path,
    conversation: Option<&str>,
    target: ReviewTarget,
) -> Result<()> {
    let harness = runtime.harness(agent, Capability::Review)?;
    let conversation = open_conversation(runtime, harness.as_ref(), workspace, conversation, None).await?;

    let request = ReviewRequest {
        conversation,
        target,
    };
    let handle = harness
        .start_review(workspace, &request)
        .await
        .context("failed to start review")?;
    drain(harness.as_ref(), workspace, handle).await
}

/// Resume `existing` or start a fresh conversation.
async fn open_conversation(
    runtime: &Runtime,
    harness: &dyn Harness,
    workspace: &Path,
    existing: Option<&str>,
    model: Option<String>,
) -> Result<ConversationRef> {
    let conversation = match existing {
        Some(id) => {
            runtime
                .registry
                .require(harness.agent_id(), Capability::ConversationResume)?;
            harness
                .resume_conversation(workspace, &ConversationRef::new(id))
                .await
                .with_context(|| format!("failed to resume conversation {id}"))?
        }
        None => {
            let options = ConversationOptions {
                model,
                ..Default::default()
            };
            harness
                .new_conversation(workspace, &options)
                .await
                .context("failed to start conversation")?
        }
    };
    eprintln!("conversation: {conversation}");
    Ok(conversation)
}

/// Print every event of the turn. The first Ctrl-C asks the agent to
/// interrupt and keeps draining until it confirms; a second one exits.
async fn drain(harness: &dyn Harness, workspace: &Path, handle: TurnHandle) -> Result<()> {
    let TurnHandle {
        conversation,
        turn,
        events,
    } = handle;
    eprintln!("turn: {turn}");

    let interrupt = CancellationToken::new();
    let watcher = {
        let interrupt = interrupt.clone();
        let got_first_signal = Arc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                if got_first_signal.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForce exit.");
                    std::process::exit(130);
                }
                eprintln!("\nInterrupting turn (Ctrl+C again to force)...");
                interrupt.cancel();
            }
        })
    };

    let mut events = normalize_stream(conversation.clone(), turn.clone(), events);
    let mut last: Option<CanonicalEvent> = None;
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = interrupt.cancelled(), if !interrupted => {
                interrupted = true;
                info!(%conversation, %turn, "interrupt requested");
                if let Err(e) = harness.interrupt(workspace, &conversation, &turn).await {
                    warn!(error = %e, "interrupt failed");
                }
                continue;
            }
        };
        let Some(event) = event else { break };
        println!("{}", serde_json::to_string(&event)?);
        last = Some(event);
    }
    watcher.abort();

    match last {
        Some(event) if event.kind == CanonicalKind::Error => {
            bail!("turn failed: {}", event.payload["message"].as_str().unwrap_or("unknown error"))
        }
        Some(event) if event.kind == CanonicalKind::TurnCompleted => {
            let status = event.payload["status"].as_str().unwrap_or("completed");
            eprintln!("turn finished: {status}");
            Ok(())
        }
        _ => bail!("turn stream ended without completion"),
    }
}

/// Review target from the mutually exclusive `review` flags.
pub fn review_target(
    base: Option<String>,
    commit: Option<String>,
    instructions: Option<String>,
) -> ReviewTarget {
    match (base, commit, instructions) {
        (Some(branch), _, _) => ReviewTarget::BaseBranch { branch },
        (None, Some(sha), _) => ReviewTarget::Commit { sha, title: None },
        (None, None, Some(instructions)) => ReviewTarget::Custom { instructions },
        (None, None, None) => ReviewTarget::UncommittedChanges,
    }
}
