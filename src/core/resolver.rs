//! Reference resolution and dependency DAG construction.
//!
//! Builds a DAG from explicit `depends_on` edges plus references embedded in
//! attribute values, and computes topological order using Kahn's algorithm
//! with declaration-order tie-breaking.

use super::error::GraphError;
use super::types::*;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Replace every `Ref` attribute of `spec` with the referenced output.
pub fn resolve_references(
    spec: &ResourceSpec,
    outputs: &HashMap<String, Outputs>,
) -> Result<ResourceSpec, GraphError> {
    let mut resolved = spec.clone();
    for value in resolved.attributes.values_mut() {
        if let AttrValue::Ref(r) = value {
            let found = outputs
                .get(&r.resource)
                .and_then(|o| o.get(&r.output))
                .ok_or_else(|| GraphError::UnresolvedOutput {
                    resource: spec.id.clone(),
                    target: r.resource.clone(),
                    output: r.output.clone(),
                })?;
            *value = found.clone();
        }
    }
    Ok(resolved)
}

/// Build a topological execution order from resource dependencies.
pub fn build_execution_order(specs: &[ResourceSpec]) -> Result<Vec<String>, GraphError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for spec in specs {
        if !seen.insert(&spec.id) {
            return Err(GraphError::DuplicateResource(spec.id.clone()));
        }
    }

    let mut nodes = Vec::with_capacity(specs.len());
    for spec in specs {
        let deps = spec.dependencies();
        for dep in &deps {
            if !seen.contains(dep.as_str()) {
                return Err(GraphError::UnknownReference {
                    resource: spec.id.clone(),
                    target: dep.clone(),
                });
            }
        }
        nodes.push((spec.id.clone(), deps));
    }

    order_nodes(&nodes)
}

/// Kahn's algorithm over `(id, dependencies)` pairs. Among ready nodes the
/// earliest declared goes first. Edges to ids not in `nodes` are ignored.
pub fn order_nodes(nodes: &[(String, Vec<String>)]) -> Result<Vec<String>, GraphError> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, (id, _))| (id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (i, (_, deps)) in nodes.iter().enumerate() {
        for dep in deps {
            if let Some(&d) = index.get(dep.as_str()) {
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_first() {
        order.push(nodes[current].0.clone());
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    if order.len() != nodes.len() {
        let members = nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, (id, _))| id.clone())
            .collect();
        return Err(GraphError::CyclicDependency(members));
    }

    Ok(order)
}
