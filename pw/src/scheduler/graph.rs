//! Stage DAG utilities - validation, layering, cohort grouping
//!
//! The scheduler executes a command layer by layer: layer N holds every
//! stage whose dependencies all live in layers < N. Stages in one layer
//! that share a `parallel_group` tag form a cohort and run concurrently.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{CommandDescriptor, Stage};

/// DAG validation failures
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("Dependency cycle involving stage '{0}'")]
    Cycle(String),
}

/// Validate that the command's stages form a DAG with resolvable edges
pub fn validate_dag(command: &CommandDescriptor) -> Result<(), GraphError> {
    let mut names = HashSet::new();
    for stage in &command.stages {
        if !names.insert(stage.name.as_str()) {
            return Err(GraphError::DuplicateStage(stage.name.clone()));
        }
    }

    for stage in &command.stages {
        for dep in &stage.depends_on {
            if !names.contains(dep.as_str()) {
                return Err(GraphError::UnknownDependency {
                    stage: stage.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Kahn's algorithm; anything left over sits on a cycle
    let mut in_degree: HashMap<&str, usize> = command
        .stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut visited = 0;

    while let Some(name) = queue.pop_front() {
        visited += 1;
        for stage in &command.stages {
            if stage.depends_on.iter().any(|d| d == name) {
                let d = in_degree.get_mut(stage.name.as_str()).expect("known stage");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(stage.name.as_str());
                }
            }
        }
    }

    if visited != command.stages.len() {
        let on_cycle = command
            .stages
            .iter()
            .find(|s| in_degree[s.name.as_str()] > 0)
            .expect("unvisited stage exists");
        return Err(GraphError::Cycle(on_cycle.name.clone()));
    }

    Ok(())
}

/// Compute topological layers: layer N = stages whose deps are all in
/// layers < N. Call only on a validated DAG.
pub fn topological_layers(command: &CommandDescriptor) -> Vec<Vec<&Stage>> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Stage> = command.stages.iter().collect();
    let mut layers = Vec::new();

    while !remaining.is_empty() {
        let (ready, rest): (Vec<&Stage>, Vec<&Stage>) = remaining
            .into_iter()
            .partition(|s| s.depends_on.iter().all(|d| placed.contains(d.as_str())));
        debug_assert!(!ready.is_empty(), "validated DAG cannot stall");
        for stage in &ready {
            placed.insert(stage.name.as_str());
        }
        layers.push(ready);
        remaining = rest;
    }

    layers
}

/// Split one layer into execution cohorts
///
/// Stages sharing a `parallel_group` tag run together; untagged stages run
/// as singleton cohorts, in declaration order.
pub fn cohorts<'a>(layer: &[&'a Stage]) -> Vec<Vec<&'a Stage>> {
    let mut grouped: Vec<(Option<&str>, Vec<&Stage>)> = Vec::new();

    for stage in layer {
        let tag = stage.parallel_group.as_deref();
        match (tag, grouped.iter_mut().find(|(t, _)| *t == tag && t.is_some())) {
            (Some(_), Some((_, members))) => members.push(stage),
            _ => grouped.push((tag, vec![stage])),
        }
    }

    grouped.into_iter().map(|(_, members)| members).collect()
}
