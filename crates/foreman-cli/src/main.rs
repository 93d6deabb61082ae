mod agents_cmd;
mod catalog_cmd;
mod config;
mod runtime;
mod turn_cmd;

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use config::{ApprovalPolicy, ForemanConfig};
use runtime::{Runtime, workspace_or_cwd};

#[derive(Parser)]
#[command(name = "foreman", about = "Supervisor and client for subprocess-backed coding agents")]
struct Cli {
    /// Config file (overrides FOREMAN_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// How to answer agent approval requests (overrides FOREMAN_APPROVALS)
    #[arg(long, global = true, value_enum)]
    approvals: Option<ApprovalPolicy>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// List registered agents and whether their programs are installed
    Agents,
    /// Start every installed agent in a workspace and report its handshake
    Doctor {
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// List the models an agent offers
    Models {
        /// Agent id
        #[arg(long, default_value = "codex")]
        agent: String,
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Print JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// List stored conversations
    Conversations {
        /// Agent id
        #[arg(long, default_value = "codex")]
        agent: String,
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Cursor returned by a previous page
        #[arg(long)]
        cursor: Option<String>,
        /// Page size
        #[arg(long)]
        limit: Option<u32>,
        /// Print JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Run one turn and stream its events as JSON lines
    Run {
        /// Prompt to send
        prompt: String,
        /// Agent id
        #[arg(long, default_value = "codex")]
        agent: String,
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
        /// Model override
        #[arg(long)]
        model: Option<String>,
        /// Reasoning effort override
        #[arg(long)]
        effort: Option<String>,
    },
    /// Ask an agent to review changes and stream its events as JSON lines
    Review {
        /// Agent id
        #[arg(long, default_value = "codex")]
        agent: String,
        /// Workspace directory (defaults to the current directory)
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
        /// Review the diff against this base branch
        #[arg(long, conflicts_with_all = ["commit", "instructions"])]
        base: Option<String>,
        /// Review a single commit
        #[arg(long, conflicts_with = "instructions")]
        commit: Option<String>,
        /// Free-form review instructions
        #[arg(long)]
        instructions: Option<String>,
    },
    /// Print shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

/// Execute the `foreman init` command: write config file.
fn cmd_init(cli_path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config::init_target(cli_path.as_deref());
    config::write_default_config(&path, force)?;
    println!("Config written to {}", path.display());
    println!();
    println!("Next: run `foreman doctor` to check that your agents start.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // -----------------------------------------------------------------
    // Commands that never start an agent.
    // -----------------------------------------------------------------
    match cli.command {
        Commands::Init { force } => return cmd_init(cli.config, force),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "foreman", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Agents => {
            let resolved = ForemanConfig::resolve(cli.config.as_deref(), cli.approvals)?;
            return agents_cmd::run_agents(&resolved.registry()?);
        }
        _ => {}
    }

    // -----------------------------------------------------------------
    // Everything else shares one supervisor, closed on the way out.
    // -----------------------------------------------------------------
    let resolved = ForemanConfig::resolve(cli.config.as_deref(), cli.approvals)?;
    let runtime = Runtime::start(&resolved)?;
    let result = run_command(cli.command, &resolved, &runtime).await;
    runtime.shutdown().await;

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => Err(e),
    }
}

/// Run an agent-backed command. `Ok(false)` means "completed, but report
/// failure through the exit status".
async fn run_command(command: Commands, resolved: &ForemanConfig, runtime: &Runtime) -> anyhow::Result<bool> {
    match command {
        Commands::Doctor { workspace } => {
            let workspace = workspace_or_cwd(workspace)?;
            agents_cmd::run_doctor(resolved, runtime, &workspace).await
        }
        Commands::Models {
            agent,
            workspace,
            json,
        } => {
            let workspace = workspace_or_cwd(workspace)?;
            catalog_cmd::run_models(runtime, &agent, &workspace, json).await?;
            Ok(true)
        }
        Commands::Conversations {
            agent,
            workspace,
            cursor,
            limit,
            json,
        } => {
            let workspace = workspace_or_cwd(workspace)?;
            catalog_cmd::run_conversations(runtime, &agent, &workspace, cursor.as_deref(), limit, json)
                .await?;
            Ok(true)
        }
        Commands::Run {
            prompt,
            agent,
            workspace,
            conversation,
            model,
            effort,
        } => {
            let workspace = workspace_or_cwd(workspace)?;
            let options = turn_cmd::RunOptions {
                prompt,
                conversation,
                model,
                effort,
            };
            turn_cmd::run_turn(runtime, &agent, &workspace, options).await?;
            Ok(true)
        }
        Commands::Review {
            agent,
            workspace,
            conversation,
            base,
            commit,
            instructions,
        } => {
            let workspace = workspace_or_cwd(workspace)?;
            let target = turn_cmd::review_target(base, commit, instructions);
            turn_cmd::run_review(runtime, &agent, &workspace, conversation.as_deref(), target).await?;
            Ok(true)
        }
        Commands::Init { .. } | Commands::Completions { .. } | Commands::Agents => Ok(true),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "foreman",
            "run",
            "fix the build",
            "--agent",
            "opencode",
            "--approvals",
            "prompt",
            "--config",
            "/tmp/foreman.toml",
        ])
        .unwrap();
        assert_eq!(cli.approvals, Some(ApprovalPolicy::Prompt));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/foreman.toml")));
        match cli.command {
            Commands::Run { prompt, agent, .. } => {
                assert_eq!(prompt, "fix the build");
                assert_eq!(agent, "opencode");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn review_targets_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["foreman", "review", "--base", "main", "--commit", "abc"]);
        assert!(result.is_err());
    }
}
