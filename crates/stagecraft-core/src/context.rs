use crate::history::IterationRecord;
use crate::stage::Stage;
use crate::types::StageType;

/// Upstream material for one generation call: dependency contents in
/// pipeline order, then the target stage's accepted iterations oldest first.
#[derive(Debug, Clone, Default)]
pub struct UpstreamContext {
    pub dependencies: Vec<Stage>,
    pub history: Vec<IterationRecord>,
}

impl UpstreamContext {
    pub fn render(&self) -> String {
        let mut out = String::new();
        for stage in &self.dependencies {
            out.push_str(&format!(
                "## {} (v{})\n\n{}\n\n",
                heading(stage.stage_type),
                stage.version,
                stage.content.trim_end()
            ));
        }
        if !self.history.is_empty() {
            out.push_str("## Iteration history\n\n");
            for (n, record) in self.history.iter().enumerate() {
                out.push_str(&format!(
                    "{}. [{}] v{} -> v{} ({})\n   feedback: {}\n   change: {}\n",
                    n + 1,
                    record.timestamp.format("%Y-%m-%d %H:%M"),
                    record.version_before,
                    record.version_after,
                    record.judge_verdict,
                    one_line(&record.feedback),
                    one_line(&record.semantic_summary),
                ));
            }
        }
        out
    }
}

fn heading(stage: StageType) -> String {
    match stage {
        StageType::Premise => "Premise".to_string(),
        StageType::Treatment => "Treatment".to_string(),
        StageType::StructurePlan => "Structure plan".to_string(),
        StageType::ChapterPlan(i) => format!("Chapter plan {i}"),
        StageType::Prose(i) => format!("Prose, chapter {i}"),
    }
}

fn one_line(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
