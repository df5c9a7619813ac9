//! Execution planner - orders resources along their dependencies
//!
//! Callers declare resources in a deterministic insertion order plus a
//! small set of edges. [`ExecutionPlan::build`] produces a total order with
//! a stable topological sort: whenever several resources are ready, the
//! one inserted first goes first.

use std::collections::BTreeSet;
use thiserror::Error;

/// How strongly a later step depends on an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Ordering only: a failure of the earlier step does not block
    Order,
    /// Prerequisite: if the earlier step fails, the later one is blocked
    Hard,
}

/// Edge between two declared resources, by insertion index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub before: usize,
    pub after: usize,
    pub dependency: Dependency,
}

/// Planning errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("edge references unknown resource index {0}")]
    UnknownIndex(usize),
    #[error("dependency cycle involving {0} resources")]
    Cycle(usize),
}

/// One step of a plan, with indices of the steps it hard-depends on.
#[derive(Debug)]
pub struct PlanStep<R> {
    pub resource: R,
    /// Indices (into the plan) of hard prerequisites; always earlier steps
    pub depends_on: Vec<usize>,
}

/// Graph builder collecting resources and edges before ordering.
#[derive(Debug)]
pub struct PlanBuilder<R> {
    nodes: Vec<R>,
    edges: Vec<Edge>,
}

impl<R> PlanBuilder<R> {
    /// Create a new empty builder
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Declare a resource, returning its insertion index.
    pub fn add(&mut self, resource: R) -> usize {
        self.nodes.push(resource);
        self.nodes.len() - 1
    }

    /// `after` must run once `before` finished; failures block it.
    pub fn requires(&mut self, after: usize, before: usize) {
        self.edge(before, after, Dependency::Hard);
    }

    /// `after` must run once `before` finished; failures do not block it.
    pub fn after(&mut self, after: usize, before: usize) {
        self.edge(before, after, Dependency::Order);
    }

    fn edge(&mut self, before: usize, after: usize, dependency: Dependency) {
        if before != after {
            self.edges.push(Edge {
                before,
                after,
                dependency,
            });
        }
    }

    /// Declared resources
    pub fn resources(&self) -> &[R] {
        &self.nodes
    }

    /// Number of declared resources
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check if nothing was declared
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Order the declared resources into a plan.
    pub fn build(self) -> Result<ExecutionPlan<R>, PlanError> {
        ExecutionPlan::build(self.nodes, &self.edges)
    }
}

impl<R> Default for PlanBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// A totally ordered plan
#[derive(Debug)]
pub struct ExecutionPlan<R> {
    steps: Vec<PlanStep<R>>,
}

impl<R> ExecutionPlan<R> {
    /// Create a new empty plan
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Stable topological sort of `nodes` along `edges`.
    pub fn build(nodes: Vec<R>, edges: &[Edge]) -> Result<Self, PlanError> {
        let n = nodes.len();
        let mut indegree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for edge in edges {
            if edge.before >= n {
                return Err(PlanError::UnknownIndex(edge.before));
            }
            if edge.after >= n {
                return Err(PlanError::UnknownIndex(edge.after));
            }
            successors[edge.before].push(edge.after);
            indegree[edge.after] += 1;
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &succ in &successors[next] {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    ready.insert(succ);
                }
            }
        }
        if order.len() != n {
            return Err(PlanError::Cycle(n - order.len()));
        }

        // position[original index] = index in the plan
        let mut position = vec![0usize; n];
        for (pos, &orig) in order.iter().enumerate() {
            position[orig] = pos;
        }

        let mut slots: Vec<Option<R>> = nodes.into_iter().map(Some).collect();
        let mut steps = Vec::with_capacity(n);
        for &orig in &order {
            let mut depends_on: Vec<usize> = edges
                .iter()
                .filter(|e| e.after == orig && e.dependency == Dependency::Hard)
                .map(|e| position[e.before])
                .collect();
            depends_on.sort_unstable();
            depends_on.dedup();
            if let Some(resource) = slots[orig].take() {
                steps.push(PlanStep {
                    resource,
                    depends_on,
                });
            }
        }
        Ok(Self { steps })
    }

    /// Ordered steps
    pub fn steps(&self) -> &[PlanStep<R>] {
        &self.steps
    }

    /// Consume into ordered steps
    pub fn into_steps(self) -> Vec<PlanStep<R>> {
        self.steps
    }

    /// Ordered resources
    pub fn resources(&self) -> impl Iterator<Item = &R> {
        self.steps.iter().map(|s| &s.resource)
    }

    /// Total number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<R> Default for ExecutionPlan<R> {
    fn default() -> Self {
        Self::new()
    }
}
