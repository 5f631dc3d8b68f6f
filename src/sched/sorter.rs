// src/sched/sorter.rs

//! Priority-ordered topological sorting.
//!
//! `TopoSorter` is a live Kahn-style sorter: `get_ready` surfaces nodes whose
//! dependencies have completed, `done` unlocks dependents. `BuildSorter`
//! wraps it for the scheduler: nodes without a build reason are artifacts
//! already on disk and complete immediately, reasoned nodes accumulate into a
//! ready list kept sorted by build priority.

use std::collections::{HashMap, HashSet, VecDeque};
use tracing::info;

use crate::error::{Error, Result};
use crate::sched::reason::{build_priority, BuildReason};

/// Incremental Kahn's-algorithm topological sorter
struct TopoSorter {
    /// Outstanding (not yet done) predecessor count per node
    pending: HashMap<String, usize>,
    /// Node -> nodes waiting on it
    dependents: HashMap<String, Vec<String>>,
    /// Ready, not yet handed out
    ready: VecDeque<String>,
    /// Handed out, not yet done
    yielded: HashSet<String>,
    unfinished: usize,
}

impl TopoSorter {
    /// Prepare the sorter; rejects graphs with cycles
    fn new(graph: &HashMap<String, HashSet<String>>) -> Result<Self> {
        let mut nodes: HashSet<String> = graph.keys().cloned().collect();
        for deps in graph.values() {
            nodes.extend(deps.iter().cloned());
        }

        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            let deps = graph.get(node);
            let count = deps.map_or(0, |d| d.len());
            pending.insert(node.clone(), count);
            if let Some(deps) = deps {
                for dep in deps {
                    dependents.entry(dep.clone()).or_default().push(node.clone());
                }
            }
        }

        // cycle check: a dry Kahn run must visit every node
        let mut counts = pending.clone();
        let mut queue: VecDeque<String> = counts
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut visited = 0usize;
        while let Some(node) = queue.pop_front() {
            visited += 1;
            if let Some(waiting) = dependents.get(&node) {
                for dependent in waiting {
                    let count = counts.get_mut(dependent).unwrap();
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
        if visited != nodes.len() {
            let mut remaining: Vec<String> = counts
                .into_iter()
                .filter(|(_, c)| *c > 0)
                .map(|(n, _)| n)
                .collect();
            remaining.sort();
            return Err(Error::DependencyCycle(remaining));
        }

        let mut initial: Vec<String> = pending
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(n, _)| n.clone())
            .collect();
        initial.sort();

        Ok(Self {
            unfinished: nodes.len(),
            ready: initial.into(),
            yielded: HashSet::new(),
            pending,
            dependents,
        })
    }

    /// Nodes that became ready since the last call
    fn get_ready(&mut self) -> Vec<String> {
        let batch: Vec<String> = self.ready.drain(..).collect();
        for node in &batch {
            self.yielded.insert(node.clone());
        }
        batch
    }

    /// Mark a yielded node complete, unlocking its dependents
    fn done(&mut self, node: &str) -> Result<()> {
        if !self.yielded.remove(node) {
            return Err(Error::Scheduler(format!(
                "done() on a node that was not ready: {}",
                node
            )));
        }
        self.unfinished -= 1;
        if let Some(waiting) = self.dependents.get(node) {
            let mut unlocked = Vec::new();
            for dependent in waiting {
                let count = self.pending.get_mut(dependent).unwrap();
                *count -= 1;
                if *count == 0 {
                    unlocked.push(dependent.clone());
                }
            }
            unlocked.sort();
            self.ready.extend(unlocked);
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.unfinished > 0
    }
}

/// The scheduler-facing sorter: priority-ordered ready list over the DAG
pub struct BuildSorter {
    topo: TopoSorter,
    /// Effective build priority per reasoned package
    priorities: HashMap<String, u8>,
    /// Human-readable reason summaries, logged when a package surfaces
    reason_lines: HashMap<String, String>,
    /// Reasoned packages currently ready, sorted by priority (stable)
    ready: Vec<String>,
}

impl BuildSorter {
    pub fn new(
        depmap: &HashMap<String, HashSet<String>>,
        build_reasons: &HashMap<String, Vec<BuildReason>>,
    ) -> Result<Self> {
        let topo = TopoSorter::new(depmap)?;

        let mut priorities = HashMap::new();
        let mut reason_lines = HashMap::new();
        for (pkgbase, reasons) in build_reasons {
            priorities.insert(pkgbase.clone(), build_priority(pkgbase, build_reasons));
            let summary: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
            reason_lines.insert(pkgbase.clone(), summary.join("; "));
        }

        Ok(Self {
            topo,
            priorities,
            reason_lines,
            ready: Vec::new(),
        })
    }

    /// Snapshot of the ready packages, in dispatch order.
    ///
    /// Pumps the underlying sorter first: nodes without a reason complete
    /// immediately, reasoned nodes join the ready list.
    pub fn get_ready(&mut self) -> Result<Vec<String>> {
        loop {
            let batch = self.topo.get_ready();
            if batch.is_empty() {
                break;
            }
            for node in batch {
                if let Some(priority) = self.priorities.get(&node).copied() {
                    info!(
                        "building {} (priority {}) because: {}",
                        node,
                        priority,
                        self.reason_lines.get(&node).map(String::as_str).unwrap_or("")
                    );
                    self.insert_ready(node, priority);
                } else {
                    // no reason: the artifact already exists on disk
                    self.topo.done(&node)?;
                }
            }
        }
        Ok(self.ready.clone())
    }

    /// Insert keeping the list sorted by priority; ties keep arrival order
    fn insert_ready(&mut self, node: String, priority: u8) {
        let position = self
            .ready
            .iter()
            .position(|other| self.priorities[other] > priority)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, node);
    }

    /// Remove a package from the ready list and complete it in the sorter
    pub fn done(&mut self, pkgbase: &str) -> Result<()> {
        self.ready.retain(|p| p != pkgbase);
        self.topo.done(pkgbase)
    }

    pub fn is_active(&self) -> bool {
        self.topo.is_active()
    }

    /// Effective priority of a reasoned package
    pub fn priority_of(&self, pkgbase: &str) -> u8 {
        self.priorities
            .get(pkgbase)
            .copied()
            .unwrap_or(crate::sched::reason::LOWEST_PRIORITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, HashSet<String>> {
        edges
            .iter()
            .map(|(node, deps)| {
                (
                    node.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    fn reasons(pairs: &[(&str, BuildReason)]) -> HashMap<String, Vec<BuildReason>> {
        let mut map: HashMap<String, Vec<BuildReason>> = HashMap::new();
        for (pkg, reason) in pairs {
            map.entry(pkg.to_string()).or_default().push(reason.clone());
        }
        map
    }

    #[test]
    fn test_linear_order() {
        let depmap = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let map = reasons(&[
            ("a", BuildReason::Cmdline),
            ("b", BuildReason::Cmdline),
            ("c", BuildReason::Cmdline),
        ]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        assert_eq!(sorter.get_ready().unwrap(), vec!["a"]);
        sorter.done("a").unwrap();
        assert_eq!(sorter.get_ready().unwrap(), vec!["b"]);
        sorter.done("b").unwrap();
        assert_eq!(sorter.get_ready().unwrap(), vec!["c"]);
        sorter.done("c").unwrap();
        assert!(!sorter.is_active());
    }

    #[test]
    fn test_unreasoned_nodes_complete_immediately() {
        // b is on disk already: a becomes ready without anyone touching b
        let depmap = graph(&[("a", &["b"])]);
        let map = reasons(&[("a", BuildReason::Cmdline)]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        assert_eq!(sorter.get_ready().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_ready_sorted_by_priority() {
        let depmap = graph(&[("p1", &[]), ("p2", &[]), ("p3", &[])]);
        let map = reasons(&[
            ("p3", BuildReason::Cmdline),
            ("p1", BuildReason::UpdatedPkgrel),
            ("p2", BuildReason::UpdatedFailed),
        ]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        assert_eq!(sorter.get_ready().unwrap(), vec!["p1", "p2", "p3"]);
    }

    #[test]
    fn test_cycle_rejected_at_preparation() {
        let depmap = graph(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]);
        let map = reasons(&[("a", BuildReason::Cmdline)]);
        match BuildSorter::new(&depmap, &map) {
            Err(Error::DependencyCycle(nodes)) => {
                assert_eq!(nodes, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected DependencyCycle, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_done_on_unready_node_rejected() {
        let depmap = graph(&[("a", &["b"]), ("b", &[])]);
        let map = reasons(&[("a", BuildReason::Cmdline), ("b", BuildReason::Cmdline)]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        let _ = sorter.get_ready().unwrap();
        assert!(sorter.done("a").is_err());
    }

    #[test]
    fn test_snapshot_is_stable_against_done() {
        let depmap = graph(&[("a", &[]), ("b", &[]), ("c", &["a"])]);
        let map = reasons(&[
            ("a", BuildReason::Cmdline),
            ("b", BuildReason::Cmdline),
            ("c", BuildReason::Cmdline),
        ]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        let snapshot = sorter.get_ready().unwrap();
        assert_eq!(snapshot, vec!["a", "b"]);
        sorter.done("a").unwrap();
        // the earlier snapshot is untouched; a fresh query reflects progress
        assert_eq!(snapshot, vec!["a", "b"]);
        assert_eq!(sorter.get_ready().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_priority_tie_keeps_arrival_order() {
        let depmap = graph(&[("x", &[]), ("y", &[]), ("z", &[])]);
        let map = reasons(&[
            ("z", BuildReason::Cmdline),
            ("x", BuildReason::Cmdline),
            ("y", BuildReason::Cmdline),
        ]);
        let mut sorter = BuildSorter::new(&depmap, &map).unwrap();

        // all priority 3; arrival (alphabetical from the topo layer) rules
        assert_eq!(sorter.get_ready().unwrap(), vec!["x", "y", "z"]);
    }
}
