//! Graph validator: rejects handler sets with unknown dependencies or
//! cycles. Three-colour DFS, O(V+E).

use rustpress_core::error::{Error, Result};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validates a `name -> depends_on` map for one event type. Every name
/// in a `depends_on` list must be a key of `edges`; the implied directed
/// graph must be acyclic.
pub fn validate_graph(event_type: &str, edges: &HashMap<String, Vec<String>>) -> Result<()> {
    for (name, deps) in edges {
        for dep in deps {
            if !edges.contains_key(dep) {
                return Err(Error::unknown_dependency(event_type, name, dep));
            }
        }
    }

    let mut colors: HashMap<&str, Color> = edges.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    for start in edges.keys() {
        if colors[start.as_str()] == Color::White {
            if let Some(cycle) = visit(start, edges, &mut colors, &mut path) {
                return Err(Error::cycle_detected(event_type, cycle));
            }
        }
    }

    Ok(())
}

fn visit<'a>(
    name: &'a str,
    edges: &'a HashMap<String, Vec<String>>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<String> {
    colors.insert(name, Color::Gray);
    path.push(name);

    if let Some(deps) = edges.get(name) {
        for dep in deps {
            let dep = dep.as_str();
            match colors.get(dep).copied().unwrap_or(Color::White) {
                Color::White => {
                    if let Some(cycle) = visit(dep, edges, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<&str> = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle.join(" -> "));
                }
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(name, Color::Black);
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(name, deps)| {
                (
                    name.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_linear_dag_is_valid() {
        let edges = edges(&[("validate", &[]), ("charge", &["validate"]), ("notify", &["charge"])]);
        assert!(validate_graph("checkout", &edges).is_ok());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let edges = edges(&[("charge", &["validate"])]);
        let err = validate_graph("checkout", &edges).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { .. }));
    }

    #[test]
    fn test_self_cycle_rejected() {
        let edges = edges(&[("a", &["a"])]);
        let err = validate_graph("checkout", &edges).unwrap_err();
        assert!(matches!(err, Error::CycleDetected { .. }));
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let edges = edges(&[("a", &["b"]), ("b", &["a"])]);
        let err = validate_graph("checkout", &edges).unwrap_err();
        match err {
            Error::CycleDetected { cycle, .. } => {
                assert!(cycle.contains("a") && cycle.contains("b"));
            }
            other => panic!("expected cycle_detected, got {other:?}"),
        }
    }

    #[test]
    fn test_diamond_dag_is_valid() {
        let edges = edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert!(validate_graph("checkout", &edges).is_ok());
    }
}
