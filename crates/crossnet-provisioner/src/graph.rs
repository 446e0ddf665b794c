//! Dependency graph over resources
//!
//! Provisioning walks the graph forward; teardown walks it with every edge
//! reversed, so a resource is deleted only after everything that depends on
//! it is gone.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use crossnet_core::Resource;
use serde::Serialize;

use crate::error::{ProvisionError, Result};

/// Operator entry point that owns a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Identity,
    Base,
    Connectivity,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Identity => "identity",
            Phase::Base => "base",
            Phase::Connectivity => "connectivity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub resource: Resource,
    pub phase: Phase,
    /// May run concurrently with adjacent fan-out steps
    pub fan_out: bool,
    /// Keys of the resources this one needs
    pub deps: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct StepGraph {
    steps: Vec<Step>,
    index: HashMap<String, usize>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step; returns its key for use as a dependency
    pub fn add(&mut self, resource: Resource, phase: Phase, deps: &[&str]) -> Result<String> {
        self.insert(resource, phase, deps, false)
    }

    /// Add a step that may run alongside other fan-out steps
    pub fn add_fan_out(
        &mut self,
        resource: Resource,
        phase: Phase,
        deps: &[&str],
    ) -> Result<String> {
        self.insert(resource, phase, deps, true)
    }

    fn insert(
        &mut self,
        resource: Resource,
        phase: Phase,
        deps: &[&str],
        fan_out: bool,
    ) -> Result<String> {
        let key = resource.key();
        if self.index.contains_key(&key) {
            return Err(ProvisionError::Graph(format!("duplicate step {}", key)));
        }
        self.index.insert(key.clone(), self.steps.len());
        self.steps.push(Step {
            resource,
            phase,
            fan_out,
            deps: deps.iter().map(|d| d.to_string()).collect(),
        });
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, key: &str) -> Option<&Step> {
        self.index.get(key).map(|&i| &self.steps[i])
    }

    /// Edges as `(dependency, dependent)` index pairs
    fn edges(&self) -> Result<Vec<(usize, usize)>> {
        let mut edges = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.deps {
                let &d = self.index.get(dep).ok_or_else(|| {
                    ProvisionError::Graph(format!(
                        "{} depends on unknown {}",
                        step.resource.key(),
                        dep
                    ))
                })?;
                edges.push((d, i));
            }
        }
        Ok(edges)
    }

    /// Creation order: dependencies first, insertion order among ready steps
    pub fn provision_order(&self) -> Result<Vec<&Step>> {
        let edges = self.edges()?;
        let order = kahn(self.steps.len(), &edges, |i| Reverse((0u8, i)))?;
        Ok(order.into_iter().map(|i| &self.steps[i]).collect())
    }

    /// Creation order restricted to one phase
    pub fn phase_order(&self, phase: Phase) -> Result<Vec<&Step>> {
        Ok(self
            .provision_order()?
            .into_iter()
            .filter(|s| s.phase == phase)
            .collect())
    }

    /// Deletion order: dependents first; among ready steps the lowest
    /// teardown rank wins, then the most recently added
    pub fn teardown_order(&self) -> Result<Vec<&Step>> {
        let reversed: Vec<(usize, usize)> =
            self.edges()?.into_iter().map(|(a, b)| (b, a)).collect();
        let steps = &self.steps;
        let order = kahn(steps.len(), &reversed, |i| {
            Reverse((steps[i].resource.kind.teardown_rank(), usize::MAX - i))
        })?;
        Ok(order.into_iter().map(|i| &self.steps[i]).collect())
    }
}

/// Kahn's algorithm; `priority` picks among ready nodes (max-heap)
fn kahn<P: Ord>(
    n: usize,
    edges: &[(usize, usize)],
    priority: impl Fn(usize) -> P,
) -> Result<Vec<usize>> {
    let mut indegree = vec![0usize; n];
    let mut out: Vec<Vec<usize>> = vec![Vec::new(); n];
    for &(from, to) in edges {
        indegree[to] += 1;
        out[from].push(to);
    }

    let mut ready: BinaryHeap<(P, usize)> = (0..n)
        .filter(|&i| indegree[i] == 0)
        .map(|i| (priority(i), i))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some((_, i)) = ready.pop() {
        order.push(i);
        for &next in &out[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push((priority(next), next));
            }
        }
    }

    if order.len() != n {
        return Err(ProvisionError::Graph(format!(
            "dependency cycle among {} steps",
            n - order.len()
        )));
    }
    Ok(order)
}
