//! `foreman models` and `foreman conversations`.

use std::path::Path;

use anyhow::{Context, Result};

use foreman_core::Capability;
use foreman_core::harness::ConversationPage;

use crate::runtime::Runtime;

pub async fn run_models(runtime: &Runtime, agent: &str, workspace: &Path, json: bool) -> Result<()> {
    let harness = runtime.harness(agent, Capability::ModelListing)?;
    let models = harness
        .model_catalog(workspace)
        .await
        .with_context(|| format!("failed to list models for {agent}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(());
    }
    if models.is_empty() {
        println!("No models reported by {agent}.");
        return Ok(());
    }
    for model in &models {
        let marker = if model.is_default { "*" } else { " " };
        match &model.display_name {
            Some(name) => println!("{marker} {} ({name})", model.id),
            None => println!("{marker} {}", model.id),
        }
    }
    Ok(())
}

pub async fn run_conversations(
    runtime: &Runtime,
    agent: &str,
    workspace: &Path,
    cursor: Option<&str>,
    limit: Option<u32>,
    json: bool,
) -> Result<()> {
    let harness = runtime.harness(agent, Capability::ConversationListing)?;
    let page = harness
        .list_conversations(workspace, cursor, limit)
        .await
        .with_context(|| format!("failed to list conversations for {agent}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }
    print_page(&page);
    Ok(())
}

fn print_page(page: &ConversationPage) {
    if page.conversations.is_empty() {
        println!("No conversations.");
    }
    for summary in &page.conversations {
        let updated = summary
            .updated_at
            .map(|at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        let preview = summary.preview.as_deref().map(first_line).unwrap_or("");
        println!("{}  {updated}  {preview}", summary.conversation);
    }
    if let Some(cursor) = &page.next_cursor {
        println!();
        println!("More: --cursor {cursor}");
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
