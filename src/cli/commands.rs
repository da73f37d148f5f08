//! CLI command definitions for swe-conductor.
//!
//! Runs the quality pipeline against a local worktree, replays durable event
//! logs, and prints the agent role catalogue.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use crate::agents::RoleRegistry;
use crate::collaborators::GitDiffProvider;
use crate::events::{EventBus, JsonlEventStore};
use crate::llm::{LiteLlmClient, ProviderRegistry};
use crate::pipeline::{PipelineConfig, PipelineRequest, PipelineRunner, PipelineStatus, Tier};

/// Multi-agent code quality pipeline and issue-to-PR session conductor.
#[derive(Parser)]
#[command(name = "swe-conductor")]
#[command(about = "Run multi-agent quality checks over a git worktree")]
#[command(version)]
#[command(
    long_about = "swe-conductor classifies a changeset by size, runs a tier-dependent set of LLM review agents over it in parallel and aggregates their findings into one quality report.\n\nModel access goes through an OpenAI-compatible endpoint configured with LITELLM_API_BASE.\n\nExample usage:\n  swe-conductor pipeline run --worktree ./app --branch feature/login --base main"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Quality pipeline commands.
    Pipeline(PipelineArgs),

    /// Print the event log of a request or session as JSON lines.
    Events(EventsArgs),

    /// Print the active agent role catalogue.
    Roles(RolesArgs),
}

/// Pipeline entrypoint arguments.
#[derive(Parser, Debug)]
pub struct PipelineArgs {
    #[command(subcommand)]
    pub command: PipelineSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum PipelineSubcommand {
    /// Run one quality pipeline to completion and print its record.
    Run(PipelineRunArgs),
}

/// Arguments for `swe-conductor pipeline run`.
#[derive(Parser, Debug)]
pub struct PipelineRunArgs {
    /// Path of the git worktree holding the branch.
    #[arg(short = 'w', long)]
    pub worktree: PathBuf,

    /// Branch under review.
    #[arg(short = 'b', long)]
    pub branch: String,

    /// Base branch the diff is computed against.
    #[arg(long, default_value = "main")]
    pub base: String,

    /// Force a tier (small, medium, large) instead of classifying the diff.
    #[arg(long)]
    pub tier: Option<String>,

    /// Comma-separated agent list; overrides the tier's default set.
    #[arg(long, value_delimiter = ',')]
    pub agents: Option<Vec<String>>,

    /// Request id; generated when omitted.
    #[arg(long)]
    pub request_id: Option<String>,

    /// Directory for the durable event log.
    #[arg(long, env = "CONDUCTOR_EVENT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Exit with a non-zero status unless the pipeline is approved.
    #[arg(long)]
    pub strict: bool,
}

/// Arguments for `swe-conductor events`.
#[derive(Parser, Debug)]
pub struct EventsArgs {
    /// Request or session id.
    pub correlation_id: String,

    /// Directory holding the event logs.
    #[arg(long, env = "CONDUCTOR_EVENT_LOG_DIR", default_value = "./conductor-events")]
    pub log_dir: PathBuf,
}

/// Arguments for `swe-conductor roles`.
#[derive(Parser, Debug)]
pub struct RolesArgs {
    /// YAML file overlaying the built-in catalogue.
    #[arg(long, env = "CONDUCTOR_ROLES_FILE")]
    pub roles_file: Option<PathBuf>,

    /// Output the full role definitions as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Pipeline(args) => match args.command {
            PipelineSubcommand::Run(args) => run_pipeline_command(args).await,
        },
        Commands::Events(args) => run_events_command(args).await,
        Commands::Roles(args) => run_roles_command(args),
    }
}

async fn run_pipeline_command(args: PipelineRunArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env().context("invalid CONDUCTOR_* configuration")?;
    if let Some(dir) = args.log_dir {
        config.event_log_dir = dir;
    }

    let client = LiteLlmClient::from_env().context("model endpoint is not configured")?;
    let providers = ProviderRegistry::single(config.default_provider.clone(), Arc::new(client));
    let bus = Arc::new(EventBus::new(Arc::new(JsonlEventStore::new(
        config.event_log_dir.clone(),
    ))));

    let mut request = PipelineRequest::new(args.branch, args.worktree).with_base_branch(args.base);
    if let Some(id) = args.request_id {
        request = request.with_request_id(id);
    }
    if let Some(tier) = args.tier {
        let tier: Tier = tier.parse().map_err(anyhow::Error::msg)?;
        request = request.with_tier(tier);
    }
    if let Some(agents) = args.agents {
        request = request.with_agents(agents.into_iter().filter(|a| !a.trim().is_empty()));
    }

    let runner = PipelineRunner::from_config(config, providers, Arc::new(GitDiffProvider), bus)?;
    info!(request_id = %request.request_id, "Running quality pipeline");
    let record = runner.run(request).await?;

    println!("{}", serde_json::to_string_pretty(&record)?);

    if args.strict && record.status != PipelineStatus::Approved {
        anyhow::bail!("pipeline {} ended in state '{}'", record.request_id, record.status);
    }
    Ok(())
}

async fn run_events_command(args: EventsArgs) -> anyhow::Result<()> {
    let bus = EventBus::new(Arc::new(JsonlEventStore::new(args.log_dir)));
    let events = bus.get_events(&args.correlation_id).await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

fn run_roles_command(args: RolesArgs) -> anyhow::Result<()> {
    let roles = match &args.roles_file {
        Some(path) => RoleRegistry::load(path)?,
        None => RoleRegistry::with_defaults(),
    };

    if args.json {
        let all: Vec<_> = roles.roles().collect();
        println!("{}", serde_json::to_string_pretty(&all)?);
        return Ok(());
    }

    let mut names = roles.names();
    names.sort_unstable();
    for name in names {
        if let Some(role) = roles.get(name) {
            println!(
                "{:<14} max_turns={:<3} tools=[{}]  {}",
                role.name,
                role.max_turns,
                role.tools.join(","),
                role.description
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_pipeline_run_args() {
        let cli = Cli::try_parse_from([
            "swe-conductor",
            "pipeline",
            "run",
            "--worktree",
            "/work/app",
            "--branch",
            "feature/x",
            "--agents",
            "tests,security",
            "--tier",
            "large",
        ])
        .unwrap();
        match cli.command {
            Commands::Pipeline(PipelineArgs {
                command: PipelineSubcommand::Run(args),
            }) => {
                assert_eq!(args.base, "main");
                assert_eq!(
                    args.agents,
                    Some(vec!["tests".to_string(), "security".to_string()])
                );
                assert_eq!(args.tier.as_deref(), Some("large"));
            }
            _ => panic!("expected pipeline run"),
        }
    }

    #[tokio::test]
    async fn test_events_command_on_empty_log() {
        let dir = tempfile::tempdir().unwrap();
        let args = EventsArgs {
            correlation_id: "missing".to_string(),
            log_dir: dir.path().to_path_buf(),
        };
        assert!(run_events_command(args).await.is_ok());
    }
}
