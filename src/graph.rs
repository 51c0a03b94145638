//! Dependency graph construction and topological ordering.
//!
//! Expands a [`Resolution`] into a DAG of kind-tagged edges and emits a
//! deterministic build order using Kahn's algorithm; packages at the same
//! depth are ordered by name (`BTreeSet` ready set). A cycle is never
//! tolerated: it means the configuration is unbuildable, so the builder fails
//! with the cycle members.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, Result};
use crate::formula::{DependencyKind, ResolvedPackage};
use crate::index::FormulaIndex;
use crate::platform::PlatformFingerprint;
use crate::resolve::Resolution;

/// One directed edge: `from` depends on `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub kind: DependencyKind,
}

/// DAG over one resolved package set
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    pub nodes: BTreeMap<String, ResolvedPackage>,
    pub edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    /// Build the graph for a resolution. Edges are restricted to packages in
    /// the resolved set; the resolver has already expanded the closure, so a
    /// dependency outside the set means it was deliberately excluded
    /// (test-only, disabled option, platform mismatch).
    pub fn build(
        index: &FormulaIndex,
        platform: &PlatformFingerprint,
        resolution: &Resolution,
    ) -> Result<Self> {
        let mut edges = Vec::new();

        for (name, pkg) in &resolution.packages {
            let formula = index.lookup(name)?;
            for dep in formula.install_dependencies(platform, &pkg.options) {
                if resolution.packages.contains_key(&dep.name) {
                    edges.push(DependencyEdge {
                        from: name.clone(),
                        to: dep.name.clone(),
                        kind: dep.kind,
                    });
                }
            }
        }

        Ok(Self {
            nodes: resolution.packages.clone(),
            edges,
        })
    }

    /// Names a node must wait for before building (its direct dependencies)
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|e| e.from == name)
            .map(|e| e.to.as_str())
            .collect()
    }

    /// Direct dependents of a node, across all edge kinds
    pub fn dependents_of(&self, name: &str) -> BTreeSet<&str> {
        self.edges
            .iter()
            .filter(|e| e.to == name)
            .map(|e| e.from.as_str())
            .collect()
    }

    /// Topological build order: every dependency precedes its dependents,
    /// ties broken by package name. Fails with the cycle members when the
    /// graph is not a DAG.
    pub fn topo_order(&self) -> Result<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|n| (n.as_str(), 0)).collect();
        let mut adjacency: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

        for edge in &self.edges {
            if let Some(count) = indegree.get_mut(edge.from.as_str()) {
                *count += 1;
            }
            adjacency
                .entry(edge.to.as_str())
                .or_default()
                .insert(edge.from.as_str());
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut ordered = Vec::with_capacity(self.nodes.len());
        while let Some(name) = ready.iter().next().copied() {
            ready.remove(name);
            ordered.push(name.to_string());
            if let Some(dependents) = adjacency.get(name) {
                for dependent in dependents {
                    if let Some(count) = indegree.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
        }

        if ordered.len() != self.nodes.len() {
            let remaining: BTreeSet<&str> = indegree
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(EngineError::CyclicDependency {
                members: self.trace_cycle(&remaining),
            });
        }

        Ok(ordered)
    }

    /// Walk dependency edges inside the unprocessed set until a node repeats;
    /// the path from that repeat onward is an actual cycle. Downstream
    /// dependents of the cycle are unprocessed too but are not cycle members.
    fn trace_cycle(&self, remaining: &BTreeSet<&str>) -> Vec<String> {
        let Some(start) = remaining.iter().next().copied() else {
            return Vec::new();
        };
        let mut path: Vec<&str> = Vec::new();
        let mut current = start;
        loop {
            if let Some(pos) = path.iter().position(|n| *n == current) {
                let mut members: Vec<String> =
                    path[pos..].iter().map(|n| n.to_string()).collect();
                members.sort();
                return members;
            }
            path.push(current);
            match self
                .edges
                .iter()
                .find(|e| e.from == current && remaining.contains(e.to.as_str()))
            {
                Some(edge) => current = edge.to.as_str(),
                // Every unprocessed node keeps an edge into the unprocessed
                // set, so this arm is unreachable; report the walk if not.
                None => return path.iter().map(|n| n.to_string()).collect(),
            }
        }
    }

    /// Transitive closure over runtime edges only. Build-only edges are
    /// excluded: they do not constrain the installed artifact, so upgrade
    /// impact analysis and removal checks must not see them.
    pub fn runtime_closure(&self, name: &str) -> BTreeSet<String> {
        let mut closure = BTreeSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            for edge in &self.edges {
                if edge.from == current
                    && edge.kind != DependencyKind::Build
                    && closure.insert(edge.to.clone())
                {
                    stack.push(edge.to.clone());
                }
            }
        }
        closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Formula;
    use crate::resolve::{Request, resolve};

    fn platform() -> PlatformFingerprint {
        PlatformFingerprint {
            os: "linux".to_string(),
            arch: "x86_64".to_string(),
            os_series: "linux".to_string(),
            toolchain: "gcc".to_string(),
            toolchain_version: 13,
        }
    }

    fn formula(json: serde_json::Value) -> Formula {
        serde_json::from_value(json).unwrap()
    }

    fn graph_for(formulae: Vec<Formula>, roots: &[&str]) -> Result<(DependencyGraph, Vec<String>)> {
        let idx = FormulaIndex::build(formulae).unwrap();
        let requests: Vec<Request> = roots.iter().map(|r| Request::new(*r)).collect();
        let resolution = resolve(&idx, &platform(), &requests)?;
        let graph = DependencyGraph::build(&idx, &platform(), &resolution)?;
        let order = graph.topo_order()?;
        Ok((graph, order))
    }

    #[test]
    fn test_order_puts_dependencies_first() {
        // The canonical A/B/C shape: B build-depends on A, C runtime-depends
        // on A and build-depends on B.
        let (graph, order) = graph_for(
            vec![
                formula(serde_json::json!({"name": "a", "version": "1.0"})),
                formula(serde_json::json!({
                    "name": "b", "version": "1.0",
                    "dependencies": [{"name": "a", "kind": "build"}],
                })),
                formula(serde_json::json!({
                    "name": "c", "version": "1.0",
                    "dependencies": [
                        {"name": "a"},
                        {"name": "b", "kind": "build"}
                    ],
                })),
            ],
            &["c"],
        )
        .unwrap();

        assert_eq!(order, vec!["a", "b", "c"]);
        for edge in &graph.edges {
            let from_pos = order.iter().position(|n| n == &edge.from).unwrap();
            let to_pos = order.iter().position(|n| n == &edge.to).unwrap();
            assert!(to_pos < from_pos, "{} must precede {}", edge.to, edge.from);
        }
    }

    #[test]
    fn test_ties_broken_by_name() {
        let (_, order) = graph_for(
            vec![
                formula(serde_json::json!({"name": "zeta", "version": "1"})),
                formula(serde_json::json!({"name": "alpha", "version": "1"})),
                formula(serde_json::json!({
                    "name": "top", "version": "1",
                    "dependencies": [{"name": "zeta"}, {"name": "alpha"}],
                })),
            ],
            &["top"],
        )
        .unwrap();
        assert_eq!(order, vec!["alpha", "zeta", "top"]);
    }

    #[test]
    fn test_cycle_reports_members_and_no_partial_order() {
        let err = graph_for(
            vec![
                formula(serde_json::json!({
                    "name": "alpha", "version": "1",
                    "dependencies": [{"name": "beta"}],
                })),
                formula(serde_json::json!({
                    "name": "beta", "version": "1",
                    "dependencies": [{"name": "gamma"}],
                })),
                formula(serde_json::json!({
                    "name": "gamma", "version": "1",
                    "dependencies": [{"name": "alpha"}],
                })),
            ],
            &["alpha"],
        )
        .unwrap_err();

        match err {
            EngineError::CyclicDependency { members } => {
                assert_eq!(members, vec!["alpha", "beta", "gamma"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_report_excludes_downstream_dependents() {
        // outsider depends on the ying <-> yang cycle but is not part of it
        let err = graph_for(
            vec![
                formula(serde_json::json!({
                    "name": "ying", "version": "1",
                    "dependencies": [{"name": "yang"}],
                })),
                formula(serde_json::json!({
                    "name": "yang", "version": "1",
                    "dependencies": [{"name": "ying"}],
                })),
                formula(serde_json::json!({
                    "name": "outsider", "version": "1",
                    "dependencies": [{"name": "ying"}],
                })),
            ],
            &["outsider"],
        )
        .unwrap_err();

        match err {
            EngineError::CyclicDependency { members } => {
                assert_eq!(members, vec!["yang", "ying"]);
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn test_runtime_closure_excludes_build_edges() {
        let (graph, _) = graph_for(
            vec![
                formula(serde_json::json!({"name": "a", "version": "1.0"})),
                formula(serde_json::json!({
                    "name": "b", "version": "1.0",
                    "dependencies": [{"name": "a", "kind": "build"}],
                })),
                formula(serde_json::json!({
                    "name": "c", "version": "1.0",
                    "dependencies": [
                        {"name": "a"},
                        {"name": "b", "kind": "build"}
                    ],
                })),
            ],
            &["c"],
        )
        .unwrap();

        let closure = graph.runtime_closure("c");
        assert!(closure.contains("a"));
        assert!(!closure.contains("b"), "build-only edge must be excluded");
        assert!(graph.runtime_closure("b").is_empty());
    }

    #[test]
    fn test_dependents_of() {
        let (graph, _) = graph_for(
            vec![
                formula(serde_json::json!({"name": "zlib", "version": "1"})),
                formula(serde_json::json!({
                    "name": "libpng", "version": "1",
                    "dependencies": [{"name": "zlib"}],
                })),
                formula(serde_json::json!({
                    "name": "freetype", "version": "1",
                    "dependencies": [{"name": "zlib"}, {"name": "libpng"}],
                })),
            ],
            &["freetype"],
        )
        .unwrap();

        let dependents = graph.dependents_of("zlib");
        assert!(dependents.contains("libpng"));
        assert!(dependents.contains("freetype"));
    }
}
