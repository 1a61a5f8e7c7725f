//! Static dependency and cascade relationships between stages.
//!
//! The graph is a DAG by construction: every edge points from a stage to a
//! strictly smaller stage in the pipeline's total order.

use crate::types::StageType;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    chapters: u32,
    /// stage -> stages it depends on, ascending.
    dependencies: BTreeMap<StageType, Vec<StageType>>,
    /// stage -> stages that depend on it directly, ascending.
    dependents: BTreeMap<StageType, Vec<StageType>>,
}

impl DependencyGraph {
    /// Build the adjacency for a pipeline with `chapters` chapter plans and
    /// prose chapters (indices `0..chapters`).
    pub fn new(chapters: u32) -> Self {
        let mut nodes: Vec<StageType> = StageType::head().to_vec();
        nodes.extend((0..chapters).map(StageType::ChapterPlan));
        nodes.extend((0..chapters).map(StageType::Prose));

        let mut dependencies = BTreeMap::new();
        let mut dependents: BTreeMap<StageType, Vec<StageType>> =
            nodes.iter().map(|&n| (n, Vec::new())).collect();

        for &node in &nodes {
            let deps = direct_dependencies(node);
            for &dep in &deps {
                if let Some(list) = dependents.get_mut(&dep) {
                    list.push(node);
                }
            }
            dependencies.insert(node, deps);
        }
        for list in dependents.values_mut() {
            list.sort();
        }

        Self {
            chapters,
            dependencies,
            dependents,
        }
    }

    pub fn chapters(&self) -> u32 {
        self.chapters
    }

    pub fn contains(&self, stage: StageType) -> bool {
        self.dependencies.contains_key(&stage)
    }

    /// Every stage of the graph in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = StageType> + '_ {
        self.dependencies.keys().copied()
    }

    /// Stages that must exist and be non-stale before `stage` can be
    /// generated, in pipeline order. Empty for stages outside the graph.
    pub fn dependencies_of(&self, stage: StageType) -> &[StageType] {
        self.dependencies
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every stage invalidated, directly or transitively, when `stage`
    /// changes. Excludes `stage` itself.
    pub fn cascade_of(&self, stage: StageType) -> BTreeSet<StageType> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([stage]);
        while let Some(current) = queue.pop_front() {
            let Some(next) = self.dependents.get(&current) else {
                continue;
            };
            for &dependent in next {
                if seen.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }
}

fn direct_dependencies(stage: StageType) -> Vec<StageType> {
    match stage {
        StageType::Premise => Vec::new(),
        StageType::Treatment => vec![StageType::Premise],
        StageType::StructurePlan => vec![StageType::Treatment],
        StageType::ChapterPlan(i) => std::iter::once(StageType::StructurePlan)
            .chain((0..i).map(StageType::ChapterPlan))
            .collect(),
        StageType::Prose(i) => std::iter::once(StageType::ChapterPlan(i))
            .chain((0..i).map(StageType::Prose))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
