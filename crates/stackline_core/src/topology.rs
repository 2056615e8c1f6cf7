//! Topology graph over stacks.
//!
//! Stacks are nodes; an edge `A -> B` means A depends on B, so B must be
//! deployed before A and torn down after it. The graph is kept acyclic at all
//! times: an insertion that would close a cycle is rejected and leaves the
//! graph as it was.
//!
//! Deployment order is computed with Kahn's algorithm, one layer at a time.
//! Layer `n` holds the stacks whose longest dependency chain has length `n`;
//! within a layer, stacks keep their insertion order. The same layers are
//! exposed as [`TopologyGraph::deployment_waves`] for concurrent deployment.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::stack::{Stack, StackId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    Unvisited,
    Visiting,
    Visited,
}

/// An import whose producer is missing or not an ancestor of the importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ImportIssue {
    /// No stack in the graph exports this name.
    NoProducer { stack: StackId, import: String },
    /// The producer exists but the importer does not (transitively) depend on it.
    NotAncestor {
        stack: StackId,
        import: String,
        producer: StackId,
    },
}

impl std::fmt::Display for ImportIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportIssue::NoProducer { stack, import } => {
                write!(f, "{} imports '{}' which no stack exports", stack, import)
            }
            ImportIssue::NotAncestor {
                stack,
                import,
                producer,
            } => write!(
                f,
                "{} imports '{}' from {} without depending on it",
                stack, import, producer
            ),
        }
    }
}

/// The set of stacks and their dependency edges.
#[derive(Debug, Clone, Default)]
pub struct TopologyGraph {
    stacks: Vec<Stack>,
    index: HashMap<StackId, usize>,
    /// `deps[i]` are the stacks `stacks[i]` depends on.
    deps: Vec<Vec<usize>>,
}

impl TopologyGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stack together with the stacks it depends on.
    ///
    /// Dependencies must already be in the graph. A stack depending on itself
    /// is a cycle. Export names must not collide with another stack's.
    pub fn add_stack<I, S>(&mut self, stack: Stack, depends_on: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<StackId>,
    {
        if self.index.contains_key(&stack.id) {
            return Err(CoreError::DuplicateStack(stack.id));
        }

        let mut deps = Vec::new();
        for dep in depends_on {
            let dep = dep.into();
            if dep == stack.id {
                return Err(CoreError::CyclicDependency {
                    path: vec![dep.clone(), dep],
                });
            }
            let idx = self.require(&dep)?;
            if !deps.contains(&idx) {
                deps.push(idx);
            }
        }

        for export in &stack.exports {
            if let Some(owner) = self.producer_of(&export.name) {
                return Err(CoreError::DuplicateExport {
                    name: export.name.clone(),
                    owner: owner.clone(),
                });
            }
        }

        debug!(
            "Adding stack {} (depends on: {})",
            stack.id,
            deps.iter()
                .map(|&d| self.stacks[d].id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.index.insert(stack.id.clone(), self.stacks.len());
        self.stacks.push(stack);
        self.deps.push(deps);
        Ok(())
    }

    /// Add a dependency edge between two stacks already in the graph.
    ///
    /// Fails with `CyclicDependency` if the edge would close a cycle, in which
    /// case the graph is left unchanged. Adding an existing edge is a no-op.
    pub fn add_dependency(&mut self, stack: &StackId, depends_on: &StackId) -> CoreResult<()> {
        let from = self.require(stack)?;
        let to = self.require(depends_on)?;

        if self.deps[from].contains(&to) {
            return Ok(());
        }

        self.deps[from].push(to);
        if let Some(cycle) = self.find_cycle() {
            self.deps[from].pop();
            return Err(CoreError::CyclicDependency {
                path: cycle.into_iter().map(|i| self.stacks[i].id.clone()).collect(),
            });
        }

        debug!("Added dependency {} -> {}", stack, depends_on);
        Ok(())
    }

    /// Depth-first search with visiting/visited colouring.
    ///
    /// Returns the stacks on the first cycle found, first stack repeated at
    /// the end.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        fn visit(
            node: usize,
            deps: &[Vec<usize>],
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            colors[node] = Color::Visiting;
            path.push(node);
            for &next in &deps[node] {
                match colors[next] {
                    Color::Visiting => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Color::Unvisited => {
                        if let Some(cycle) = visit(next, deps, colors, path) {
                            return Some(cycle);
                        }
                    }
                    Color::Visited => {}
                }
            }
            path.pop();
            colors[node] = Color::Visited;
            None
        }

        let mut colors = vec![Color::Unvisited; self.stacks.len()];
        let mut path = Vec::new();
        for node in 0..self.stacks.len() {
            if colors[node] == Color::Unvisited {
                if let Some(cycle) = visit(node, &self.deps, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn require(&self, id: &StackId) -> CoreResult<usize> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| CoreError::UnknownStack(id.to_string()))
    }

    /// Get a stack by id.
    pub fn get(&self, id: &StackId) -> Option<&Stack> {
        self.index.get(id).map(|&i| &self.stacks[i])
    }

    pub fn contains(&self, id: &StackId) -> bool {
        self.index.contains_key(id)
    }

    /// Stacks in insertion order.
    pub fn stacks(&self) -> impl Iterator<Item = &Stack> {
        self.stacks.iter()
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    /// Direct dependencies of a stack, in the order they were declared.
    pub fn dependencies(&self, id: &StackId) -> CoreResult<Vec<&StackId>> {
        let idx = self.require(id)?;
        Ok(self.deps[idx].iter().map(|&d| &self.stacks[d].id).collect())
    }

    /// Stacks that depend directly on `id`, in insertion order.
    pub fn dependents(&self, id: &StackId) -> CoreResult<Vec<&StackId>> {
        let idx = self.require(id)?;
        Ok(self
            .deps
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&idx))
            .map(|(i, _)| &self.stacks[i].id)
            .collect())
    }

    /// The stack that declares `export`, if any.
    pub fn producer_of(&self, export: &str) -> Option<&StackId> {
        self.stacks
            .iter()
            .find(|s| s.find_export(export).is_some())
            .map(|s| &s.id)
    }

    fn layers(&self) -> Vec<Vec<usize>> {
        let n = self.stacks.len();
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let dependents = self.reverse_edges();

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &dependents[node] {
                    remaining[dependent] -= 1;
                    if remaining[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            layers.push(std::mem::replace(&mut current, next));
        }
        layers
    }

    /// Stacks that depend directly on each stack, by index.
    fn reverse_edges(&self) -> Vec<Vec<usize>> {
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stacks.len()];
        for (node, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }
        dependents
    }

    /// Indices of `selection` plus everything reachable through `edges`.
    fn reachable(&self, selection: &[StackId], edges: &[Vec<usize>]) -> CoreResult<HashSet<usize>> {
        let mut seen = HashSet::new();
        let mut stack = Vec::new();
        for id in selection {
            stack.push(self.require(id)?);
        }
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(edges[node].iter().copied());
            }
        }
        Ok(seen)
    }

    /// Indices of `selection` plus everything they transitively depend on.
    fn closure(&self, selection: &[StackId]) -> CoreResult<HashSet<usize>> {
        self.reachable(selection, &self.deps)
    }

    fn ids_of(&self, nodes: HashSet<usize>) -> BTreeSet<StackId> {
        nodes.into_iter().map(|i| self.stacks[i].id.clone()).collect()
    }

    /// Ids of `selection` and all of their transitive dependencies.
    pub fn dependency_closure(&self, selection: &[StackId]) -> CoreResult<BTreeSet<StackId>> {
        Ok(self.ids_of(self.closure(selection)?))
    }

    /// Ids of `selection` and every stack that transitively depends on them.
    pub fn dependent_closure(&self, selection: &[StackId]) -> CoreResult<BTreeSet<StackId>> {
        Ok(self.ids_of(self.reachable(selection, &self.reverse_edges())?))
    }

    /// Stacks grouped into waves; every dependency of a stack is in an
    /// earlier wave.
    pub fn deployment_waves(&self) -> Vec<Vec<&Stack>> {
        self.layers()
            .into_iter()
            .map(|layer| layer.into_iter().map(|i| &self.stacks[i]).collect())
            .collect()
    }

    /// Waves restricted to the dependency closure of `selection`.
    ///
    /// `None` selects the whole graph.
    pub fn deployment_waves_for(&self, selection: Option<&[StackId]>) -> CoreResult<Vec<Vec<&Stack>>> {
        let Some(selection) = selection else {
            return Ok(self.deployment_waves());
        };
        let closure = self.closure(selection)?;
        Ok(self
            .layers()
            .into_iter()
            .map(|layer| {
                layer
                    .into_iter()
                    .filter(|i| closure.contains(i))
                    .map(|i| &self.stacks[i])
                    .collect::<Vec<_>>()
            })
            .filter(|wave| !wave.is_empty())
            .collect())
    }

    /// A valid deployment order: every stack follows all of its dependencies.
    pub fn deployment_order(&self) -> Vec<&Stack> {
        self.deployment_waves().into_iter().flatten().collect()
    }

    /// The exact reverse of [`Self::deployment_order`].
    pub fn teardown_order(&self) -> Vec<&Stack> {
        let mut order = self.deployment_order();
        order.reverse();
        order
    }

    /// Deployment order restricted to the dependency closure of `selection`.
    pub fn deployment_order_for(&self, selection: Option<&[StackId]>) -> CoreResult<Vec<&Stack>> {
        Ok(self
            .deployment_waves_for(selection)?
            .into_iter()
            .flatten()
            .collect())
    }

    /// Teardown order for `selection` and everything that depends on it.
    ///
    /// Dependencies of the selection stay in place; a stack is only torn
    /// down together with every stack still relying on it.
    pub fn teardown_order_for(&self, selection: Option<&[StackId]>) -> CoreResult<Vec<&Stack>> {
        let Some(selection) = selection else {
            return Ok(self.teardown_order());
        };
        let closure = self.reachable(selection, &self.reverse_edges())?;
        let mut order: Vec<&Stack> = self
            .deployment_order()
            .into_iter()
            .filter(|s| closure.contains(&self.index[&s.id]))
            .collect();
        order.reverse();
        Ok(order)
    }

    fn ancestors(&self, node: usize) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack: Vec<usize> = self.deps[node].clone();
        while let Some(n) = stack.pop() {
            if seen.insert(n) {
                stack.extend(self.deps[n].iter().copied());
            }
        }
        seen
    }

    /// Check that every import is exported by an ancestor of the importer.
    ///
    /// Deployment order only guarantees an import is published in time when
    /// its producer is an ancestor.
    pub fn check_imports(&self) -> Vec<ImportIssue> {
        let mut issues = Vec::new();
        for (node, stack) in self.stacks.iter().enumerate() {
            if stack.imports.is_empty() {
                continue;
            }
            let ancestors = self.ancestors(node);
            for import in &stack.imports {
                match self.producer_of(import) {
                    None => issues.push(ImportIssue::NoProducer {
                        stack: stack.id.clone(),
                        import: import.clone(),
                    }),
                    Some(producer) => {
                        let producer_idx = self.index[producer];
                        if !ancestors.contains(&producer_idx) {
                            issues.push(ImportIssue::NotAncestor {
                                stack: stack.id.clone(),
                                import: import.clone(),
                                producer: producer.clone(),
                            });
                        }
                    }
                }
            }
        }
        issues
    }
}
