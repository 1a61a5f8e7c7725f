use super::{block_on, coordinator, describe_commit, join_stages, parse_stage, policy};
use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use stagecraft_core::{
    project::Project,
    store::{ArtifactStore, FsArtifactStore},
    types::StageStatus,
};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum StageSubcommand {
    /// Print a stage's content
    Show {
        project: String,
        stage: String,
        /// Print metadata instead of content
        #[arg(long)]
        meta: bool,
    },
    /// Write a stage by hand (content from --file or stdin)
    Put {
        project: String,
        stage: String,
        #[arg(long)]
        file: Option<PathBuf>,
        /// Mark downstream stages stale instead of deleting them
        #[arg(long)]
        keep: bool,
    },
    /// Mark a draft stage approved
    Approve { project: String, stage: String },
    /// Delete a stage and invalidate everything downstream of it
    Delete {
        project: String,
        stage: String,
        #[arg(long)]
        keep: bool,
    },
    /// Invalidate everything downstream of a stage, leaving the stage itself
    Cull {
        project: String,
        stage: String,
        #[arg(long)]
        keep: bool,
    },
    /// Preview which stages a change to this stage would invalidate
    Cascade { project: String, stage: String },
    /// List the direct dependencies of a stage
    Deps { project: String, stage: String },
}

pub fn run(root: &Path, subcmd: StageSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        StageSubcommand::Show {
            project,
            stage,
            meta,
        } => show(root, &project, &stage, meta, json),
        StageSubcommand::Put {
            project,
            stage,
            file,
            keep,
        } => put(root, &project, &stage, file, keep, json),
        StageSubcommand::Approve { project, stage } => approve(root, &project, &stage, json),
        StageSubcommand::Delete {
            project,
            stage,
            keep,
        } => invalidate(root, &project, &stage, keep, true, json),
        StageSubcommand::Cull {
            project,
            stage,
            keep,
        } => invalidate(root, &project, &stage, keep, false, json),
        StageSubcommand::Cascade { project, stage } => cascade(root, &project, &stage, json),
        StageSubcommand::Deps { project, stage } => deps(root, &project, &stage, json),
    }
}

fn show(root: &Path, project: &str, stage_str: &str, meta: bool, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    Project::load(root, project).with_context(|| format!("project '{project}' not found"))?;
    let s = FsArtifactStore::new(root)
        .read(project, stage)
        .with_context(|| format!("failed to read {project}/{stage}"))?;

    if json {
        print_json(&s)?;
    } else if meta {
        println!("stage:   {}", s.stage_type);
        println!("status:  {}", s.status);
        println!("version: {}", s.version);
        println!("updated: {}", s.updated_at.format("%Y-%m-%d %H:%M:%S"));
        if let Some(at) = s.approved_at {
            println!("approved: {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
        if let Some(at) = s.stale_since {
            println!("stale since: {}", at.format("%Y-%m-%d %H:%M:%S"));
        }
    } else {
        if s.status == StageStatus::Stale {
            eprintln!("warning: {project}/{stage} is stale");
        }
        print!("{}", s.content);
        if !s.content.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn put(
    root: &Path,
    project: &str,
    stage_str: &str,
    file: Option<PathBuf>,
    keep: bool,
    json: bool,
) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let content = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read content from stdin")?;
            buf
        }
    };
    if content.trim().is_empty() {
        anyhow::bail!("refusing to write empty content to {project}/{stage}");
    }

    let coordinator = coordinator(root)?;
    let outcome = block_on(coordinator.write(project, stage, &content, Some(policy(keep))))?
        .with_context(|| format!("failed to write {project}/{stage}"))?;

    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "Wrote {project}/{stage} v{}",
            outcome.version.unwrap_or_default()
        );
        if !outcome.cascaded.is_empty() {
            println!(
                "Invalidated ({}): {}",
                outcome.invalidation,
                join_stages(&outcome.cascaded)
            );
        }
        println!("{}", describe_commit(&outcome.commit));
    }
    Ok(())
}

fn approve(root: &Path, project: &str, stage_str: &str, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let coordinator = coordinator(root)?;
    let (updated, commit) = block_on(coordinator.approve(project, stage))?
        .with_context(|| format!("failed to approve {project}/{stage}"))?;

    if json {
        print_json(&serde_json::json!({ "stage": updated, "commit": commit }))?;
    } else {
        println!("Approved: {project}/{stage} v{}", updated.version);
        println!("{}", describe_commit(&commit));
    }
    Ok(())
}

fn invalidate(
    root: &Path,
    project: &str,
    stage_str: &str,
    keep: bool,
    including_self: bool,
    json: bool,
) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let coordinator = coordinator(root)?;
    let result = if including_self {
        block_on(coordinator.remove(project, stage, policy(keep)))?
    } else {
        block_on(coordinator.cull(project, stage, policy(keep)))?
    };
    let outcome =
        result.with_context(|| format!("failed to invalidate downstream of {project}/{stage}"))?;

    if json {
        return print_json(&outcome);
    }
    if including_self {
        println!("Deleted {project}/{stage}");
    }
    if outcome.cascaded.is_empty() {
        println!("Nothing downstream to invalidate.");
    } else {
        println!(
            "Invalidated ({}): {}",
            outcome.invalidation,
            join_stages(&outcome.cascaded)
        );
    }
    println!("{}", describe_commit(&outcome.commit));
    Ok(())
}

fn cascade(root: &Path, project: &str, stage_str: &str, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let p = Project::load(root, project).with_context(|| format!("project '{project}' not found"))?;
    let store = FsArtifactStore::new(root);
    let stored = store.list(project)?;
    let graph = p.graph_for(&stored);
    let downstream = graph.cascade_of(stage);

    if json {
        let rows: Vec<_> = downstream
            .iter()
            .map(|s| serde_json::json!({ "stage": s, "exists": stored.contains(s) }))
            .collect();
        return print_json(&serde_json::json!({ "stage": stage, "cascade": rows }));
    }
    if downstream.is_empty() {
        println!("Nothing depends on {stage}.");
        return Ok(());
    }
    let rows = downstream
        .iter()
        .map(|s| {
            let status = store.status(project, *s)?;
            Ok(vec![s.to_string(), status.to_string()])
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    print_table(&["STAGE", "STATUS"], rows);
    Ok(())
}

fn deps(root: &Path, project: &str, stage_str: &str, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let p = Project::load(root, project).with_context(|| format!("project '{project}' not found"))?;
    let store = FsArtifactStore::new(root);
    let graph = p.graph_for(&store.list(project)?);
    let deps = graph.dependencies_of(stage);

    if json {
        return print_json(&serde_json::json!({ "stage": stage, "dependencies": deps }));
    }
    if deps.is_empty() {
        println!("{stage} has no dependencies.");
        return Ok(());
    }
    let rows = deps
        .iter()
        .map(|d| {
            let status = store.status(project, *d)?;
            Ok(vec![d.to_string(), status.to_string()])
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    print_table(&["DEPENDENCY", "STATUS"], rows);
    Ok(())
}
