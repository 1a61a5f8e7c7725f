mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    config::ConfigSubcommand, project::ProjectSubcommand, stage::StageSubcommand,
    version::VersionSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "stagecraft",
    about = "Iterate staged long-form content with judge-gated approval and downstream invalidation",
    version,
    propagate_version = true
)]
struct Cli {
    /// Workspace root (default: auto-detect from .stagecraft/ or .git/)
    #[arg(long, global = true, env = "STAGECRAFT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a stagecraft workspace in the current directory
    Init {
        /// Chapters planned for new projects
        #[arg(long)]
        chapters: Option<u32>,
        /// Version backend: snapshot or git
        #[arg(long)]
        committer: Option<String>,
    },

    /// Create, list and inspect projects
    Project {
        #[command(subcommand)]
        subcommand: ProjectSubcommand,
    },

    /// Read, write and invalidate individual stages
    Stage {
        #[command(subcommand)]
        subcommand: StageSubcommand,
    },

    /// Regenerate a stage until the judge approves it
    Iterate {
        project: String,
        /// premise, treatment, structure_plan, chapter_plan.<i> or prose.<i>
        stage: String,
        /// What the new version should change
        #[arg(long, short = 'f', default_value = "")]
        feedback: String,
        /// Attempts before handing the last candidate back for review
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Mark downstream stages stale instead of deleting them
        #[arg(long)]
        keep: bool,
    },

    /// Apply a stage's pending revision although the judge rejected it
    Accept {
        project: String,
        stage: String,
        #[arg(long)]
        keep: bool,
    },

    /// Discard a stage's pending revision
    Abandon { project: String, stage: String },

    /// Show the iteration history of a stage
    History { project: String, stage: String },

    /// List, create and restore project versions
    Version {
        #[command(subcommand)]
        subcommand: VersionSubcommand,
    },

    /// Inspect and validate the workspace configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Iterate { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init {
            chapters,
            committer,
        } => cmd::init::run(&root, chapters, committer.as_deref()),
        Commands::Project { subcommand } => cmd::project::run(&root, subcommand, cli.json),
        Commands::Stage { subcommand } => cmd::stage::run(&root, subcommand, cli.json),
        Commands::Iterate {
            project,
            stage,
            feedback,
            max_attempts,
            keep,
        } => cmd::iterate::run(
            &root,
            cmd::iterate::IterateArgs {
                project,
                stage,
                feedback,
                max_attempts,
                keep,
            },
            cli.json,
        ),
        Commands::Accept {
            project,
            stage,
            keep,
        } => cmd::iterate::accept(&root, &project, &stage, keep, cli.json),
        Commands::Abandon { project, stage } => {
            cmd::iterate::abandon(&root, &project, &stage, cli.json)
        }
        Commands::History { project, stage } => {
            cmd::history::run(&root, &project, &stage, cli.json)
        }
        Commands::Version { subcommand } => cmd::version::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
