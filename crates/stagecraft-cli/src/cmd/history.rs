use super::parse_stage;
use crate::output::print_json;
use anyhow::Context;
use stagecraft_core::{history::IterationHistory, project::Project};
use std::path::Path;

pub fn run(root: &Path, project: &str, stage_str: &str, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    Project::load(root, project).with_context(|| format!("project '{project}' not found"))?;
    let records = IterationHistory::new(root)
        .all(project, stage)
        .with_context(|| format!("failed to read history of {project}/{stage}"))?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No iterations recorded for {project}/{stage}.");
        return Ok(());
    }
    for r in &records {
        println!(
            "{}  v{} -> v{}  {} ({} attempt(s))",
            r.timestamp.format("%Y-%m-%d %H:%M"),
            r.version_before,
            r.version_after,
            r.judge_verdict,
            r.attempts
        );
        if !r.feedback.is_empty() {
            println!("  feedback: {}", r.feedback.trim());
        }
        println!("  change:   {}", r.semantic_summary.trim());
        if !r.judge_reasoning.is_empty() {
            println!("  judge:    {}", r.judge_reasoning.trim());
        }
    }
    Ok(())
}
