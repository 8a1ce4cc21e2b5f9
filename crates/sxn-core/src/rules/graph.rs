//! Dependency-graph scheduling: Kahn's algorithm with alphabetical tie-break
//! for a deterministic serial order, plus a ready-set helper the parallel
//! worker pool recomputes as rules finish.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;

use crate::error::{Error, Result};

use super::types::RuleDefinition;

fn build_graph(rules: &BTreeMap<String, RuleDefinition>) -> Result<DiGraphMap<&str, ()>> {
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for name in rules.keys() {
        graph.add_node(name.as_str());
    }
    for (name, def) in rules {
        for dep in &def.dependencies {
            if !rules.contains_key(dep) {
                return Err(Error::UnknownDependency {
                    rule: name.clone(),
                    dependency: dep.clone(),
                });
            }
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }
    Ok(graph)
}

fn in_degrees<'a>(rules: &'a BTreeMap<String, RuleDefinition>) -> BTreeMap<&'a str, usize> {
    let mut degrees: BTreeMap<&str, usize> = rules.keys().map(|k| (k.as_str(), 0)).collect();
    for def in rules.values() {
        if let Some(entry) = degrees.get_mut(def.name.as_str()) {
            *entry = def.dependencies.len();
        }
    }
    degrees
}

/// A full serial linearization: same input always yields the same order.
pub fn topological_order(rules: &BTreeMap<String, RuleDefinition>) -> Result<Vec<String>> {
    let graph = build_graph(rules)?;
    if is_cyclic_directed(&graph) {
        return Err(Error::CyclicDependency {
            cycle: rules.keys().cloned().collect(),
        });
    }

    let mut in_degree = in_degrees(rules);
    let mut ready: BTreeSet<&str> =
        in_degree.iter().filter(|(_, &d)| d == 0).map(|(k, _)| *k).collect();
    let mut order = Vec::with_capacity(rules.len());

    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());
        for succ in graph.neighbors(name) {
            if let Some(entry) = in_degree.get_mut(succ) {
                *entry -= 1;
                if *entry == 0 {
                    ready.insert(succ);
                }
            }
        }
    }

    Ok(order)
}

/// Validate only: does the graph have a cycle or an unknown dependency name.
pub fn validate_acyclic(rules: &BTreeMap<String, RuleDefinition>) -> Result<()> {
    topological_order(rules).map(|_| ())
}

/// Every rule transitively downstream of `name`: its direct dependents, their
/// dependents, and so on. Used to cascade a skip when a rule with
/// `continue_on_failure` fails, since its dependents can never run correctly.
pub fn transitive_dependents(rules: &BTreeMap<String, RuleDefinition>, name: &str) -> Result<Vec<String>> {
    let graph = build_graph(rules)?;
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut stack = vec![name];
    while let Some(current) = stack.pop() {
        for succ in graph.neighbors(current) {
            if visited.insert(succ) {
                stack.push(succ);
            }
        }
    }
    Ok(visited.into_iter().map(str::to_string).collect())
}

/// Scheduler state for the parallel worker pool: tracks remaining in-degree
/// per rule and the direct dependents of each, so completions can be folded
/// in one at a time under a mutex.
pub struct Scheduler<'a> {
    graph: DiGraphMap<&'a str, ()>,
    in_degree: BTreeMap<&'a str, usize>,
}

impl<'a> Scheduler<'a> {
    pub fn new(rules: &'a BTreeMap<String, RuleDefinition>) -> Result<Self> {
        let graph = build_graph(rules)?;
        if is_cyclic_directed(&graph) {
            return Err(Error::CyclicDependency {
                cycle: rules.keys().cloned().collect(),
            });
        }
        Ok(Self {
            in_degree: in_degrees(rules),
            graph,
        })
    }

    /// Names whose dependencies have all completed (applied or skipped),
    /// in alphabetical order.
    #[must_use]
    pub fn initially_ready(&self) -> Vec<String> {
        self.in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(k, _)| (*k).to_string())
            .collect()
    }

    /// Mark `name` complete, returning any dependents that just became ready.
    #[must_use]
    pub fn complete(&mut self, name: &str) -> Vec<String> {
        let mut newly_ready = Vec::new();
        for succ in self.graph.neighbors(name).collect::<Vec<_>>() {
            if let Some(entry) = self.in_degree.get_mut(succ) {
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(succ.to_string());
                }
            }
        }
        newly_ready.sort();
        newly_ready
    }
}
