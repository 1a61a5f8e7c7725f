use super::{block_on, coordinator};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand)]
pub enum VersionSubcommand {
    /// List recorded versions, oldest first
    List { project: String },
    /// Record the project as it is now
    Commit {
        project: String,
        #[arg(long, short = 'm', default_value = "manual commit")]
        message: String,
    },
    /// Restore every stage and history to an earlier version
    Revert {
        project: String,
        #[arg(id = "target_version", value_name = "VERSION")]
        version: String,
    },
}

pub fn run(root: &Path, subcmd: VersionSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        VersionSubcommand::List { project } => list(root, &project, json),
        VersionSubcommand::Commit { project, message } => commit(root, &project, &message, json),
        VersionSubcommand::Revert { project, version } => revert(root, &project, &version, json),
    }
}

fn list(root: &Path, project: &str, json: bool) -> anyhow::Result<()> {
    let versions = coordinator(root)?
        .versions(project)
        .with_context(|| format!("failed to list versions of '{project}'"))?;

    if json {
        return print_json(&versions);
    }
    if versions.is_empty() {
        println!("No versions recorded.");
        return Ok(());
    }
    let rows = versions
        .iter()
        .map(|v| {
            vec![
                short(&v.id).to_string(),
                v.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                v.message.clone(),
            ]
        })
        .collect();
    print_table(&["VERSION", "WHEN", "MESSAGE"], rows);
    Ok(())
}

fn commit(root: &Path, project: &str, message: &str, json: bool) -> anyhow::Result<()> {
    let coordinator = coordinator(root)?;
    let id = block_on(coordinator.commit(project, message))?
        .with_context(|| format!("failed to commit '{project}'"))?;
    if json {
        print_json(&serde_json::json!({ "project": project, "version": id }))?;
    } else {
        println!("Committed {project} as {}", short(&id));
    }
    Ok(())
}

fn revert(root: &Path, project: &str, version: &str, json: bool) -> anyhow::Result<()> {
    let coordinator = coordinator(root)?;
    block_on(coordinator.revert(project, version))?
        .with_context(|| format!("failed to revert '{project}' to {version}"))?;
    if json {
        print_json(&serde_json::json!({ "project": project, "reverted_to": version }))?;
    } else {
        println!("Reverted {project} to {version}");
    }
    Ok(())
}

/// Git hashes are shortened for display; snapshot ids are already short.
fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
