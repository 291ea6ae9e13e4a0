//! Epoch scheduling: dependency layering, file-overlap exclusion, and
//! backlog staleness.
//!
//! Pure functions over work units; the controller feeds them each epoch
//! and dispatches the resulting waves in order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;

use crate::store::WorkUnit;

/// Fraction of a unit's `files_hint` already churned by merged work
/// before the unit is considered stale.
const STALE_OVERLAP_FRACTION: f64 = 0.5;

/// Why a queued unit was dropped before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Sat queued longer than `backlog_max_age_seconds`.
    TooOld,
    /// More than half its hinted files were merged since it queued.
    FileChurn,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooOld => write!(f, "queued past backlog max age"),
            Self::FileChurn => write!(f, "hinted files churned since queueing"),
        }
    }
}

/// Check a queued unit against both staleness rules.
pub fn staleness(
    unit: &WorkUnit,
    now: DateTime<Utc>,
    max_age_seconds: u64,
    merged_files: &HashSet<String>,
) -> Option<StaleReason> {
    let age = now.signed_duration_since(unit.queued_at);
    if age.num_seconds() >= 0 && age.num_seconds() as u64 > max_age_seconds {
        return Some(StaleReason::TooOld);
    }

    if !unit.files_hint.is_empty() {
        let overlapping = unit
            .files_hint
            .iter()
            .filter(|f| merged_files.contains(*f))
            .count();
        if overlapping as f64 / unit.files_hint.len() as f64 > STALE_OVERLAP_FRACTION {
            return Some(StaleReason::FileChurn);
        }
    }
    None
}

/// Whether the dependency edges among `units` form a cycle.
///
/// Dependencies pointing outside the set are treated as already
/// satisfied and ignored.
pub fn has_cycle(units: &[WorkUnit]) -> bool {
    let ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for unit in units {
        graph.add_node(unit.id.as_str());
        for dep in &unit.depends_on {
            if ids.contains(dep.as_str()) {
                graph.add_edge(dep.as_str(), unit.id.as_str(), ());
            }
        }
    }
    is_cyclic_directed(&graph)
}

/// Drop the units caught in dependency cycles, keeping the acyclic rest.
///
/// Returns `(kept, dropped_ids)`. Kahn's algorithm: whatever never
/// reaches in-degree zero is cyclic (or depends on a cycle).
pub fn strip_cycles(units: Vec<WorkUnit>) -> (Vec<WorkUnit>, Vec<String>) {
    let layers = kahn_layers(&units);
    let scheduled: HashSet<String> = layers.into_iter().flatten().collect();
    let (kept, dropped): (Vec<WorkUnit>, Vec<WorkUnit>) = units
        .into_iter()
        .partition(|u| scheduled.contains(&u.id));
    (kept, dropped.into_iter().map(|u| u.id).collect())
}

/// Kahn-style topological layers over the units' dependency edges.
///
/// Layer N holds every unit whose in-set dependencies all sit in layers
/// < N. Units trapped in cycles are omitted.
fn kahn_layers(units: &[WorkUnit]) -> Vec<Vec<String>> {
    let ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for unit in units {
        let in_set_deps = unit
            .depends_on
            .iter()
            .filter(|d| ids.contains(d.as_str()))
            .count();
        in_degree.insert(unit.id.as_str(), in_set_deps);
        for dep in &unit.depends_on {
            if ids.contains(dep.as_str()) {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(unit.id.as_str());
            }
        }
    }

    let mut layers: Vec<Vec<String>> = Vec::new();
    // Preserve plan order within each layer.
    let mut current: Vec<&str> = units
        .iter()
        .map(|u| u.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();

    while !current.is_empty() {
        let mut next: Vec<&str> = Vec::new();
        for &id in &current {
            for &dependent in dependents.get(id).map(Vec::as_slice).unwrap_or(&[]) {
                let degree = in_degree.get_mut(dependent).expect("known unit");
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }
        layers.push(current.iter().map(|s| s.to_string()).collect());
        // Keep plan order stable in the next layer too.
        let next_set: HashSet<&str> = next.into_iter().collect();
        current = units
            .iter()
            .map(|u| u.id.as_str())
            .filter(|id| next_set.contains(id))
            .collect();
    }

    layers
}

/// Split one dependency layer into conflict-free waves.
///
/// Two units conflict when their `files_hint` intersect; the
/// later-planned unit defers to a later wave. Units without hints never
/// conflict.
fn split_by_overlap(layer: Vec<&WorkUnit>) -> Vec<Vec<String>> {
    let mut waves: Vec<Vec<String>> = Vec::new();
    let mut remaining: Vec<&WorkUnit> = layer;

    while !remaining.is_empty() {
        let mut wave: Vec<String> = Vec::new();
        let mut taken_files: HashSet<&str> = HashSet::new();
        let mut deferred: Vec<&WorkUnit> = Vec::new();

        for unit in remaining {
            let conflicts = unit
                .files_hint
                .iter()
                .any(|f| taken_files.contains(f.as_str()));
            if conflicts {
                deferred.push(unit);
            } else {
                taken_files.extend(unit.files_hint.iter().map(String::as_str));
                wave.push(unit.id.clone());
            }
        }

        waves.push(wave);
        remaining = deferred;
    }

    waves
}

/// Full epoch schedule: topological layers, each split into
/// overlap-free waves, each wave capped at `max_parallel`.
///
/// Every wave completes (including its merges) before the next wave
/// dispatches, so dependency order and file exclusion both hold.
pub fn schedule_waves(units: &[WorkUnit], max_parallel: usize) -> Vec<Vec<String>> {
    let by_id: HashMap<&str, &WorkUnit> = units.iter().map(|u| (u.id.as_str(), u)).collect();
    let max_parallel = max_parallel.max(1);

    let mut waves: Vec<Vec<String>> = Vec::new();
    for layer in kahn_layers(units) {
        let layer_units: Vec<&WorkUnit> = layer.iter().map(|id| by_id[id.as_str()]).collect();
        for wave in split_by_overlap(layer_units) {
            for chunk in wave.chunks(max_parallel) {
                waves.push(chunk.to_vec());
            }
        }
    }
    waves
}
