pub mod config;
pub mod history;
pub mod init;
pub mod iterate;
pub mod project;
pub mod stage;
pub mod version;

use anyhow::Context;
use stagecraft_core::{
    collaborator::{ContentGenerator, Judge, SemanticDiffer},
    config::{CommandsConfig, Config},
    coordinator::{CommitState, StageCoordinator},
    external::{CommandDiffer, CommandGenerator, CommandJudge, ExternalCommand, Unconfigured},
    types::{Invalidation, StageType},
};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub fn parse_stage(s: &str) -> anyhow::Result<StageType> {
    StageType::from_str(s).with_context(|| format!("unknown stage: {s}"))
}

pub fn policy(keep: bool) -> Invalidation {
    if keep {
        Invalidation::KeepAll
    } else {
        Invalidation::CullAll
    }
}

/// Run a future to completion on a fresh runtime.
pub fn block_on<F: Future>(fut: F) -> anyhow::Result<F::Output> {
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    Ok(rt.block_on(fut))
}

/// Coordinator wired to the commands and versioning backend in config.yaml.
pub fn coordinator(root: &Path) -> anyhow::Result<StageCoordinator> {
    let cfg = Config::load(root).context("failed to load config")?;
    let commands = &cfg.commands;

    let generator: Arc<dyn ContentGenerator> = match external(commands, &commands.generator) {
        Some(cmd) => Arc::new(CommandGenerator(cmd)),
        None => Arc::new(Unconfigured("generator")),
    };
    let judge: Arc<dyn Judge> = match external(commands, &commands.judge) {
        Some(cmd) => Arc::new(CommandJudge(cmd)),
        None => Arc::new(Unconfigured("judge")),
    };
    let differ = external(commands, &commands.differ)
        .map(|cmd| Arc::new(CommandDiffer(cmd)) as Arc<dyn SemanticDiffer>);

    StageCoordinator::from_config(root, &cfg, generator, judge, differ)
        .context("failed to set up versioning")
}

fn external(commands: &CommandsConfig, argv: &Option<Vec<String>>) -> Option<ExternalCommand> {
    let argv = argv.as_ref().filter(|a| !a.is_empty())?;
    let cmd = ExternalCommand::new(argv.clone());
    Some(match commands.timeout_secs {
        Some(secs) => cmd.with_timeout(Duration::from_secs(secs)),
        None => cmd,
    })
}

pub fn describe_commit(commit: &CommitState) -> String {
    match commit {
        CommitState::NotAttempted => "not committed".to_string(),
        CommitState::Committed { version } => format!("committed {version}"),
        CommitState::Failed { error } => {
            format!("COMMIT FAILED ({error}); run 'stagecraft version commit' to retry")
        }
    }
}

pub fn join_stages(stages: &[StageType]) -> String {
    stages
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
