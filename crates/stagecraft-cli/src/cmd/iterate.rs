use super::{block_on, coordinator, describe_commit, join_stages, parse_stage, policy};
use crate::output::print_json;
use anyhow::Context;
use stagecraft_core::coordinator::{IterationOutcome, IterationRequest, IterationStatus};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub struct IterateArgs {
    pub project: String,
    pub stage: String,
    pub feedback: String,
    pub max_attempts: Option<u32>,
    pub keep: bool,
}

pub fn run(root: &Path, args: IterateArgs, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(&args.stage)?;
    let coordinator = coordinator(root)?;

    let cancel = CancellationToken::new();
    let mut request = IterationRequest::new(&args.project, stage, &args.feedback)
        .cancel_token(cancel.clone());
    if let Some(n) = args.max_attempts {
        request = request.max_attempts(n);
    }
    if args.keep {
        request = request.invalidation(policy(true));
    }

    let outcome = block_on(async move {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current call");
                cancel.cancel();
            }
        });
        coordinator.iterate(request).await
    })?
    .with_context(|| format!("failed to iterate {}/{stage}", args.project))?;

    report(&outcome, json)
}

pub fn accept(
    root: &Path,
    project: &str,
    stage_str: &str,
    keep: bool,
    json: bool,
) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let coordinator = coordinator(root)?;
    let invalidation = keep.then(|| policy(true));
    let outcome = block_on(coordinator.accept(project, stage, invalidation))?
        .with_context(|| format!("failed to accept pending revision of {project}/{stage}"))?;
    report(&outcome, json)
}

pub fn abandon(root: &Path, project: &str, stage_str: &str, json: bool) -> anyhow::Result<()> {
    let stage = parse_stage(stage_str)?;
    let coordinator = coordinator(root)?;
    let dropped = coordinator
        .abandon(project, stage)
        .with_context(|| format!("failed to abandon pending revision of {project}/{stage}"))?;

    if json {
        print_json(&serde_json::json!({ "abandoned": dropped }))?;
    } else {
        println!(
            "Abandoned pending revision of {project}/{stage} ({} attempt(s))",
            dropped.attempts
        );
    }
    Ok(())
}

fn report(outcome: &IterationOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        return print_json(outcome);
    }
    let target = format!("{}/{}", outcome.project, outcome.stage);
    match outcome.status {
        IterationStatus::NeedsRevision => {
            println!(
                "{target} needs revision after {} attempt(s)",
                outcome.attempts
            );
            if !outcome.last_reasoning.is_empty() {
                println!("Judge: {}", outcome.last_reasoning);
            }
            for issue in &outcome.issues {
                println!("  - {issue}");
            }
            println!(
                "Nothing was applied. Review with 'stagecraft accept {} {}' or 'stagecraft abandon {} {}'.",
                outcome.project, outcome.stage, outcome.project, outcome.stage
            );
            return Ok(());
        }
        IterationStatus::Approved => println!(
            "Approved: {target} v{} after {} attempt(s)",
            outcome.version.unwrap_or_default(),
            outcome.attempts
        ),
        IterationStatus::AcceptedByUser => println!(
            "Accepted: {target} v{} (draft, not approved by the judge)",
            outcome.version.unwrap_or_default()
        ),
        IterationStatus::Written => println!(
            "Wrote {target} v{}",
            outcome.version.unwrap_or_default()
        ),
    }
    if !outcome.cascaded.is_empty() {
        println!(
            "Invalidated ({}): {}",
            outcome.invalidation,
            join_stages(&outcome.cascaded)
        );
    }
    println!("{}", describe_commit(&outcome.commit));
    Ok(())
}
