//! Command-line front-end.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::services::{render_logs, render_table, ConfigService};
use crate::ci::engine::{PipelineStatus, RunOptions, RunOutcome};
use crate::ci::pipeline::{HistoryQuery, SessionDetail};
use crate::ci::repository::CheckoutRequest;
use crate::ci::yaml_parser::{DEFAULT_PIPELINE_FILE, PIPELINES_DIR};
use crate::error::{AppError, Result};
use crate::AppState;

#[derive(Parser, Debug)]
#[command(name = "rustci")]
#[command(author, version, about = "Container-based CI/CD pipeline runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run pipelines and inspect their history
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommand,
    },
    /// Validate pipeline files and manage the bound repository
    Config(ConfigArgs),
}

#[derive(Subcommand, Debug)]
pub enum PipelineCommand {
    /// Run a pipeline of the bound repository
    Run(RunArgs),
    /// Show past job runs
    Report(ReportArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Pipeline file to run
    #[arg(long, conflicts_with = "pipeline")]
    pub file: Option<PathBuf>,

    /// Name of a stored pipeline
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Repository to bind before running (directory or git URL)
    #[arg(long)]
    pub repo: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long)]
    pub commit: Option<String>,

    /// Use the current directory instead of the bound repository
    #[arg(long, default_value_t = false)]
    pub local: bool,

    /// Print the resolved plan without running anything
    #[arg(long, default_value_t = false)]
    pub dry_run: bool,

    /// Print the dry-run plan as YAML
    #[arg(long, default_value_t = false)]
    pub yaml: bool,

    #[arg(long = "override", value_name = "KEY=VALUE", help = OVERRIDE_HELP)]
    pub overrides: Vec<String>,
}

#[derive(Args, Debug, Default)]
pub struct ReportArgs {
    #[arg(long)]
    pub repo: Option<String>,

    #[arg(long)]
    pub pipeline: Option<String>,

    #[arg(long)]
    pub branch: Option<String>,

    #[arg(long)]
    pub stage: Option<String>,

    /// Also print the full log of every matching job
    #[arg(long)]
    pub job: Option<String>,

    #[arg(long)]
    pub run: Option<i64>,

    #[arg(long, default_value_t = false)]
    pub local: bool,
}

#[derive(Args, Debug)]
#[command(args_conflicts_with_subcommands = true)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: Option<ConfigCommand>,

    /// Validate a single pipeline file
    #[arg(long, conflicts_with = "check_all")]
    pub check: bool,

    /// Validate every pipeline file in a directory
    #[arg(long)]
    pub check_all: bool,

    #[arg(long, conflicts_with = "dir")]
    pub config_file: Option<PathBuf>,

    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Do not save valid pipelines to the bound repository
    #[arg(long, default_value_t = false)]
    pub no_set: bool,
}

const OVERRIDE_HELP: &str = "Override a configuration value, e.g. jobs.build.docker.image=rust:1.75. \
Jobs keep their resolved docker image and upload path, so a global.docker.image \
override does not change them; override jobs.<job>.docker.image instead. \
global.pipeline_name cannot be overridden";

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Apply overrides to a stored pipeline
    Override {
        #[arg(long)]
        pipeline: String,

        #[arg(long = "override", value_name = "KEY=VALUE", required = true, help = OVERRIDE_HELP)]
        overrides: Vec<String>,

        #[arg(long, default_value_t = false)]
        save: bool,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Bind a repository for subsequent commands
    SetRepo {
        repo: String,

        #[arg(long)]
        branch: Option<String>,

        #[arg(long)]
        commit: Option<String>,
    },
    /// Show the bound repository
    GetRepo,
}

impl Cli {
    /// Runs the command and returns the process exit code.
    pub async fn execute(&self, state: &AppState, cancel: CancellationToken) -> Result<i32> {
        match &self.command {
            Commands::Pipeline {
                command: PipelineCommand::Run(args),
            } => run_pipeline(state, args, cancel).await,
            Commands::Pipeline {
                command: PipelineCommand::Report(args),
            } => report(state, args).await,
            Commands::Config(args) => match &args.command {
                Some(command) => config_command(state, command).await,
                None => check_config(state, args).await,
            },
        }
    }
}

fn current_dir() -> Result<PathBuf> {
    Ok(std::env::current_dir()?)
}

/// Session for the current directory, not persisted.
async fn local_session(state: &AppState, branch: Option<&String>) -> Result<(SessionDetail, PathBuf)> {
    let checkout = state
        .checkout
        .checkout(&CheckoutRequest {
            repo: current_dir()?.display().to_string(),
            branch: branch.cloned(),
            commit: None,
        })
        .await?;
    let workspace = checkout.workspace.clone();
    Ok((checkout.into_session(&state.env.user_id), workspace))
}

async fn run_pipeline(state: &AppState, args: &RunArgs, cancel: CancellationToken) -> Result<i32> {
    let sessions = state.session_service();

    let (session, workspace) = if let Some(repo) = &args.repo {
        let bound = sessions
            .set_repo(&CheckoutRequest {
                repo: repo.clone(),
                branch: args.branch.clone(),
                commit: args.commit.clone(),
            })
            .await?;
        (bound.session, bound.workspace)
    } else if args.local {
        local_session(state, args.branch.as_ref()).await?
    } else {
        match sessions.get_repo().await {
            Ok(session) => {
                let workspace = sessions.workspace(&session);
                (session, workspace)
            }
            Err(e) if args.dry_run => {
                warn!("⚠️ {}; planning against the current directory", e);
                local_session(state, args.branch.as_ref()).await?
            }
            Err(e) => return Err(e),
        }
    };

    let options = RunOptions {
        dry_run: args.dry_run,
        local: args.local,
        yaml_output: args.yaml,
        override_configs: args.overrides.clone(),
        pipeline_name: args.pipeline.clone(),
        file_path: args.file.clone(),
        workspace: workspace.is_dir().then_some(workspace),
    };

    match state
        .orchestrator()
        .run_pipeline(&session, &options, cancel)
        .await?
    {
        RunOutcome::DryRun(plan) => {
            print!("{}", plan);
            Ok(0)
        }
        RunOutcome::Completed(summary) => {
            println!(
                "Pipeline {} run #{}: {:?}",
                summary.pipeline_name, summary.run_number, summary.status
            );
            for job in &summary.jobs {
                println!("  {:<24} {}", job.job_name, job.job_status);
            }
            Ok(match summary.status {
                PipelineStatus::Success => 0,
                PipelineStatus::Failed => 1,
            })
        }
    }
}

async fn report(state: &AppState, args: &ReportArgs) -> Result<i32> {
    let repo_url = if args.local {
        local_session(state, args.branch.as_ref()).await?.0.repo_url
    } else if let Some(repo) = &args.repo {
        match std::fs::canonicalize(repo) {
            Ok(path) if path.is_dir() => path.display().to_string(),
            _ => repo.clone(),
        }
    } else {
        state.session_service().get_repo().await?.repo_url
    };

    let query = HistoryQuery {
        repo_url,
        branch: args.branch.clone(),
        pipeline_name: args.pipeline.clone(),
        stage: args.stage.clone(),
        job_name: args.job.clone(),
        run_number: args.run,
    };
    let records = state.report_service().history(&query).await?;
    if records.is_empty() {
        println!("No job runs found for {}", query.repo_url);
        return Ok(0);
    }

    println!("{}", render_table(&records));
    if args.job.is_some() {
        println!("\n{}", render_logs(&records));
    }
    Ok(0)
}

async fn check_config(state: &AppState, args: &ConfigArgs) -> Result<i32> {
    let single = args.check || (!args.check_all && args.config_file.is_some());
    let all = args.check_all || (!args.check && args.dir.is_some());
    if !single && !all {
        return Err(AppError::InvalidInvocation(
            "nothing to do; use --check, --check-all or a subcommand".to_string(),
        ));
    }
    if (single && args.dir.is_some()) || (all && args.config_file.is_some()) {
        return Err(AppError::InvalidInvocation(
            "--check takes --config-file, --check-all takes --dir".to_string(),
        ));
    }

    let session = if args.no_set {
        None
    } else {
        match state.session_service().get_repo().await {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("⚠️ Pipelines will not be saved: {}", e);
                None
            }
        }
    };
    let save = session.is_some();
    let service = state.config_service();

    let reports = if single {
        let path = args
            .config_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(PIPELINES_DIR).join(DEFAULT_PIPELINE_FILE));
        vec![service.check_file(&path, session.as_ref(), save).await?]
    } else {
        let dir = args.dir.clone().unwrap_or_else(|| PathBuf::from(PIPELINES_DIR));
        service.check_directory(&dir, session.as_ref(), save).await?
    };

    let mut invalid = 0;
    for report in &reports {
        match &report.outcome {
            Ok(_) => println!("✅ {} ({}) is valid", report.pipeline_name, report.file_name),
            Err(errors) => {
                invalid += 1;
                println!("❌ {} ({}) is invalid:\n{}", report.pipeline_name, report.file_name, errors);
            }
        }
    }
    info!("Checked {} pipeline(s), {} invalid", reports.len(), invalid);
    Ok(if invalid == 0 { 0 } else { 1 })
}

async fn config_command(state: &AppState, command: &ConfigCommand) -> Result<i32> {
    match command {
        ConfigCommand::Override {
            pipeline,
            overrides,
            save,
            json,
        } => {
            let session = state.session_service().get_repo().await?;
            let config = state
                .config_service()
                .override_pipeline(&session, pipeline, overrides, *save)
                .await?;
            println!("{}", ConfigService::render(&config, *json)?);
            Ok(0)
        }
        ConfigCommand::SetRepo {
            repo,
            branch,
            commit,
        } => {
            let bound = state
                .session_service()
                .set_repo(&CheckoutRequest {
                    repo: repo.clone(),
                    branch: branch.clone(),
                    commit: commit.clone(),
                })
                .await?;
            print_session(&bound.session);
            let mut invalid = 0;
            for report in &bound.pipelines {
                match &report.outcome {
                    Ok(_) => println!("  ✅ {} ({})", report.pipeline_name, report.file_name),
                    Err(errors) => {
                        invalid += 1;
                        println!("  ❌ {} ({}):\n{}", report.pipeline_name, report.file_name, errors);
                    }
                }
            }
            Ok(if invalid == 0 { 0 } else { 1 })
        }
        ConfigCommand::GetRepo => {
            print_session(&state.session_service().get_repo().await?);
            Ok(0)
        }
    }
}

fn print_session(session: &SessionDetail) {
    println!("Repository: {} ({})", session.repo_name, session.repo_url);
    println!("Branch:     {}", session.branch);
    if !session.commit_hash.is_empty() {
        println!("Commit:     {}", session.commit_hash);
    }
    println!(
        "Location:   {}",
        if session.is_remote { "remote" } else { "local" }
    );
    println!("Bound at:   {}", session.time.to_rfc3339());
}
