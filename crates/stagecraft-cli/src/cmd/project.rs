use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use stagecraft_core::{
    config::Config, pending::PendingStore, project::Project, store::FsArtifactStore,
};
use std::path::Path;

#[derive(Subcommand)]
pub enum ProjectSubcommand {
    /// Create a new project
    Create {
        name: String,
        #[arg(long)]
        title: Option<String>,
        /// Planned chapters (default: default_chapters from config)
        #[arg(long)]
        chapters: Option<u32>,
    },
    /// List all projects
    List,
    /// Show every stage of a project with its status
    Show { name: String },
    /// Change the planned number of chapters
    SetChapters { name: String, chapters: u32 },
    /// Change the project title
    SetTitle { name: String, title: String },
    /// Delete a project with all stages, history and versions
    Delete { name: String },
}

pub fn run(root: &Path, subcmd: ProjectSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ProjectSubcommand::Create {
            name,
            title,
            chapters,
        } => create(root, &name, title, chapters, json),
        ProjectSubcommand::List => list(root, json),
        ProjectSubcommand::Show { name } => show(root, &name, json),
        ProjectSubcommand::SetChapters { name, chapters } => {
            update(root, &name, json, |p| p.set_chapters(chapters))
        }
        ProjectSubcommand::SetTitle { name, title } => {
            update(root, &name, json, |p| p.set_title(title))
        }
        ProjectSubcommand::Delete { name } => delete(root, &name, json),
    }
}

fn create(
    root: &Path,
    name: &str,
    title: Option<String>,
    chapters: Option<u32>,
    json: bool,
) -> anyhow::Result<()> {
    let chapters = match chapters {
        Some(n) => n,
        None => {
            Config::load(root)
                .context("failed to load config")?
                .default_chapters
        }
    };
    let project = Project::create(root, name, title, chapters)
        .with_context(|| format!("failed to create project '{name}'"))?;

    if json {
        print_json(&project)?;
    } else {
        println!(
            "Created project '{}' with {} planned chapter(s)",
            project.name, project.chapters
        );
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let projects = Project::list(root).context("failed to list projects")?;

    if json {
        return print_json(&projects);
    }
    if projects.is_empty() {
        println!("No projects.");
        return Ok(());
    }
    let rows = projects
        .iter()
        .map(|p| {
            vec![
                p.name.clone(),
                p.title.clone().unwrap_or_default(),
                p.chapters.to_string(),
                p.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["NAME", "TITLE", "CHAPTERS", "UPDATED"], rows);
    Ok(())
}

fn show(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    let project =
        Project::load(root, name).with_context(|| format!("project '{name}' not found"))?;
    let store = FsArtifactStore::new(root);
    let pending = PendingStore::new(root);
    let overview = project.overview(&store)?;

    if json {
        let stages: Vec<_> = overview
            .iter()
            .map(|row| -> anyhow::Result<serde_json::Value> {
                let mut v = serde_json::to_value(row)?;
                v["pending"] = pending.load(name, row.stage)?.is_some().into();
                Ok(v)
            })
            .collect::<anyhow::Result<_>>()?;
        return print_json(&serde_json::json!({
            "project": project,
            "stages": stages,
        }));
    }

    match &project.title {
        Some(t) => println!("{} ({t})", project.name),
        None => println!("{}", project.name),
    }
    println!("Chapters: {}\n", project.chapters);

    let mut rows = Vec::new();
    for row in &overview {
        let marker = if pending.load(name, row.stage)?.is_some() {
            "pending revision"
        } else {
            ""
        };
        rows.push(vec![
            row.stage.to_string(),
            row.status.to_string(),
            if row.version == 0 {
                "-".to_string()
            } else {
                format!("v{}", row.version)
            },
            marker.to_string(),
        ]);
    }
    print_table(&["STAGE", "STATUS", "VERSION", ""], rows);
    Ok(())
}

fn update(
    root: &Path,
    name: &str,
    json: bool,
    change: impl FnOnce(&mut Project),
) -> anyhow::Result<()> {
    let mut project =
        Project::load(root, name).with_context(|| format!("project '{name}' not found"))?;
    change(&mut project);
    project.save(root).context("failed to save project")?;

    if json {
        print_json(&project)?;
    } else {
        println!("Updated project '{}'", project.name);
    }
    Ok(())
}

fn delete(root: &Path, name: &str, json: bool) -> anyhow::Result<()> {
    Project::delete(root, name).with_context(|| format!("failed to delete project '{name}'"))?;
    if json {
        print_json(&serde_json::json!({ "project": name, "deleted": true }))?;
    } else {
        println!("Deleted project '{name}'");
    }
    Ok(())
}
