//! Job dependency layering.

use indexmap::IndexMap;
use std::collections::HashMap;

/// Splits a dependency graph into topological layers.
///
/// `graph` maps every node to its consumers (an edge `u -> v` means `u` must
/// finish before `v`). Each returned layer holds the nodes whose producers all
/// sit in earlier layers; nodes keep their input order inside a layer.
///
/// On a cycle, returns the nodes that could never be scheduled, in input order.
pub fn topological_groups(
    graph: &IndexMap<String, Vec<String>>,
) -> Result<Vec<Vec<String>>, Vec<String>> {
    let nodes: Vec<(&String, &Vec<String>)> = graph.iter().collect();
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, (node, _))| (node.as_str(), idx))
        .collect();

    let mut in_degree = vec![0usize; graph.len()];
    for consumers in graph.values() {
        for consumer in consumers {
            if let Some(&idx) = position.get(consumer.as_str()) {
                in_degree[idx] += 1;
            }
        }
    }

    let mut frontier: Vec<usize> = (0..graph.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut emitted = vec![false; graph.len()];
    let mut groups = Vec::new();

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for &idx in &frontier {
            emitted[idx] = true;
            let (_, consumers) = nodes[idx];
            for consumer in consumers {
                if let Some(&c) = position.get(consumer.as_str()) {
                    in_degree[c] -= 1;
                    if in_degree[c] == 0 {
                        next.push(c);
                    }
                }
            }
        }
        next.sort_unstable();
        next.dedup();

        groups.push(frontier.iter().map(|&idx| nodes[idx].0.clone()).collect());
        frontier = next;
    }

    let residual: Vec<String> = nodes
        .iter()
        .enumerate()
        .filter(|(idx, _)| !emitted[*idx])
        .map(|(_, (node, _))| (*node).clone())
        .collect();

    if residual.is_empty() {
        Ok(groups)
    } else {
        Err(residual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(node, consumers)| {
                (
                    node.to_string(),
                    consumers.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect()
    }

    fn groups(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|g| g.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_linear_chain() {
        let g = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
        assert_eq!(
            topological_groups(&g).unwrap(),
            groups(&[&["a"], &["b"], &["c"]])
        );
    }

    #[test]
    fn test_diamond() {
        let g = graph(&[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"]), ("d", &[])]);
        assert_eq!(
            topological_groups(&g).unwrap(),
            groups(&[&["a"], &["b", "c"], &["d"]])
        );
    }

    #[test]
    fn test_layers_follow_input_order() {
        // `z` is declared before `y`, and both unlock in the same round.
        let g = graph(&[("x", &["y"]), ("w", &["z"]), ("z", &[]), ("y", &[])]);
        assert_eq!(
            topological_groups(&g).unwrap(),
            groups(&[&["x", "w"], &["z", "y"]])
        );
    }

    #[test]
    fn test_cycle_reports_residual_nodes() {
        let g = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        assert_eq!(
            topological_groups(&g).unwrap_err(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_empty_graph() {
        let g = IndexMap::new();
        assert!(topological_groups(&g).unwrap().is_empty());
    }
}
