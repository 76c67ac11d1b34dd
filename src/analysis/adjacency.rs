//! Farm contiguity supplied by the deployment.

use std::collections::{BTreeMap, BTreeSet};

/// Undirected farm adjacency. Edges are symmetrised on construction, and a
/// farm the graph does not mention is simply isolated.
#[derive(Debug, Clone, Default)]
pub struct AdjacencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl AdjacencyGraph {
    pub fn new(raw: &BTreeMap<String, BTreeSet<String>>) -> Self {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (farm, neighbours) in raw {
            for n in neighbours {
                if n == farm {
                    continue;
                }
                edges.entry(farm.clone()).or_default().insert(n.clone());
                edges.entry(n.clone()).or_default().insert(farm.clone());
            }
        }
        Self { edges }
    }

    pub fn are_adjacent(&self, a: &str, b: &str) -> bool {
        self.edges.get(a).is_some_and(|n| n.contains(b))
    }

    /// Connected components of `farms`, using only edges between members.
    /// Components come out ordered by their smallest farm id.
    pub fn components(&self, farms: &BTreeSet<String>) -> Vec<BTreeSet<String>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut out = Vec::new();

        for start in farms {
            if seen.contains(start.as_str()) {
                continue;
            }
            let mut component = BTreeSet::new();
            let mut stack = vec![start.as_str()];
            seen.insert(start.as_str());
            while let Some(farm) = stack.pop() {
                component.insert(farm.to_string());
                if let Some(neighbours) = self.edges.get(farm) {
                    for n in neighbours {
                        if farms.contains(n) && seen.insert(n.as_str()) {
                            stack.push(n.as_str());
                        }
                    }
                }
            }
            out.push(component);
        }
        out
    }
}
