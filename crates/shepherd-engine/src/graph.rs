//! Dependency graph validation.
//!
//! The supervisor derives a graph from each command's `depends` list and
//! must reject cycles at registration time (via Kahn's algorithm). Edges to
//! identifiers that are not registered yet are tolerated: they gate startup
//! until the dependency appears, which allows registering dependents first.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// Errors from dependency graph validation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Command '{id}' depends on itself")]
    SelfDependency { id: String },

    #[error("Dependency graph contains a cycle")]
    Cycle,
}

/// Validate that the dependencies among registered commands are acyclic.
///
/// `deps` maps each registered identifier to the identifiers it depends on.
/// Edges whose target is not a key of `deps` are ignored here; they cannot
/// contribute to a cycle among registered commands.
pub fn validate_acyclic(deps: &HashMap<String, Vec<String>>) -> Result<(), GraphError> {
    for (id, dep_list) in deps {
        if dep_list.contains(id) {
            return Err(GraphError::SelfDependency { id: id.clone() });
        }
    }

    // Kahn's algorithm: compute in-degrees, process zero-degree nodes.
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in deps.keys() {
        in_degree.entry(id.as_str()).or_insert(0);
        adj.entry(id.as_str()).or_default();
    }

    for (id, dep_list) in deps {
        for dep in dep_list {
            if deps.contains_key(dep.as_str()) {
                adj.entry(dep.as_str()).or_default().push(id.as_str());
                *in_degree.entry(id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    for (id, &deg) in &in_degree {
        if deg == 0 {
            queue.push_back(id);
        }
    }

    let mut processed = 0usize;
    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(neighbors) = adj.get(id) {
            for &neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }
    }

    if processed != deps.len() {
        return Err(GraphError::Cycle);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn deps(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    (*k).to_string(),
                    v.iter().map(|s| (*s).to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn accepts_valid_chain() {
        let d = deps(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
        assert!(validate_acyclic(&d).is_ok());
    }

    #[test]
    fn accepts_diamond() {
        let d = deps(&[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
        assert!(validate_acyclic(&d).is_ok());
    }

    #[test]
    fn rejects_cycle() {
        let d = deps(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        assert!(matches!(validate_acyclic(&d), Err(GraphError::Cycle)));
    }

    #[test]
    fn rejects_two_node_cycle() {
        let d = deps(&[("a", &["b"]), ("b", &["a"])]);
        assert!(matches!(validate_acyclic(&d), Err(GraphError::Cycle)));
    }

    #[test]
    fn rejects_self_dependency() {
        let d = deps(&[("a", &["a"])]);
        assert!(matches!(
            validate_acyclic(&d),
            Err(GraphError::SelfDependency { .. })
        ));
    }

    #[test]
    fn tolerates_unregistered_dependency() {
        let d = deps(&[("b", &["not-yet-registered"])]);
        assert!(validate_acyclic(&d).is_ok());
    }

    #[test]
    fn accepts_empty_graph() {
        let d: HashMap<String, Vec<String>> = HashMap::new();
        assert!(validate_acyclic(&d).is_ok());
    }
}
