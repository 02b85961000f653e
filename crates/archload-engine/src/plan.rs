//! Dependency planning: execution order and cycle detection.

use std::collections::{BTreeSet, HashMap};

use archload_types::dataset::{DatasetDefinition, DatasetId};

use crate::errors::{ConfigurationError, IngestError, Violation, ViolationKind};

/// Order in which dataset pipelines are admitted, as indices into the
/// definition slice.
///
/// Dependencies come before their dependents; otherwise configuration order
/// is kept (Kahn's algorithm, always taking the lowest ready index).
///
/// # Errors
///
/// Returns [`IngestError::DependencyCycle`] naming the cycle path if the
/// dependency graph is not acyclic, or a configuration error if a
/// dependency names no definition.
pub fn execution_order(definitions: &[DatasetDefinition]) -> Result<Vec<usize>, IngestError> {
    let positions: HashMap<&DatasetId, usize> = definitions
        .iter()
        .enumerate()
        .map(|(i, def)| (&def.id, i))
        .collect();

    let mut upstream: Vec<Option<usize>> = Vec::with_capacity(definitions.len());
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
    let mut violations = Vec::new();

    for (i, def) in definitions.iter().enumerate() {
        let dep = match &def.depends_on {
            None => None,
            Some(dep) => match positions.get(dep) {
                Some(&j) => {
                    dependents[j].push(i);
                    Some(j)
                }
                None => {
                    violations.push(
                        Violation::record(i, "depends_on", format!("unknown dataset '{dep}'"))
                            .with_kind(ViolationKind::UnknownDependency),
                    );
                    None
                }
            },
        };
        upstream.push(dep);
    }

    if !violations.is_empty() {
        return Err(ConfigurationError { violations }.into());
    }

    let mut pending: Vec<bool> = upstream.iter().map(Option::is_some).collect();
    let mut ready: BTreeSet<usize> = (0..definitions.len()).filter(|&i| !pending[i]).collect();
    let mut order = Vec::with_capacity(definitions.len());

    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &child in &dependents[next] {
            pending[child] = false;
            ready.insert(child);
        }
    }

    if order.len() == definitions.len() {
        return Ok(order);
    }

    let start = pending.iter().position(|&p| p).unwrap_or_default();
    Err(IngestError::DependencyCycle {
        cycle: cycle_from(definitions, &upstream, start),
    })
}

/// Follow dependency links from `start` until a node repeats, returning the
/// closed loop (`a -> b -> a`).
fn cycle_from(
    definitions: &[DatasetDefinition],
    upstream: &[Option<usize>],
    start: usize,
) -> Vec<DatasetId> {
    let mut path: Vec<usize> = Vec::new();
    let mut current = Some(start);
    while let Some(node) = current {
        if let Some(pos) = path.iter().position(|&seen| seen == node) {
            let mut cycle: Vec<DatasetId> = path[pos..]
                .iter()
                .map(|&i| definitions[i].id.clone())
                .collect();
            cycle.push(definitions[node].id.clone());
            return cycle;
        }
        path.push(node);
        current = upstream[node];
    }
    path.into_iter().map(|i| definitions[i].id.clone()).collect()
}
