//! Dependency resolution over the registry.
//!
//! Edges run from a dependency to its dependent (`zlib -> libpng` means
//! libpng depends on zlib and builds after it). Node `i` is the project
//! registered `i`-th, so registration order is also node order.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::registry::ProjectRegistry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
  /// Projects on the shortest cycle found, each depending on the next and
  /// the last on the first.
  #[error("dependency cycle: {}", describe_cycle(.cycle))]
  Cycle { cycle: Vec<String> },

  #[error("unknown project '{0}'")]
  NotFound(String),
}

fn describe_cycle(cycle: &[String]) -> String {
  let mut parts: Vec<&str> = cycle.iter().map(String::as_str).collect();
  if let Some(first) = cycle.first() {
    parts.push(first);
  }
  parts.join(" -> ")
}

pub struct DependencyGraph<'a> {
  registry: &'a ProjectRegistry,
  graph: DiGraph<usize, ()>,
}

impl<'a> DependencyGraph<'a> {
  /// Build the graph. Dependency names that do not resolve are left out;
  /// [`ProjectRegistry::validate`] reports them.
  pub fn new(registry: &'a ProjectRegistry) -> Self {
    let mut graph = DiGraph::with_capacity(registry.len(), registry.len());
    for i in 0..registry.len() {
      graph.add_node(i);
    }

    for (i, project) in registry.all().iter().enumerate() {
      for dependency in project.dependencies() {
        if let Some(dep) = registry.index_of(dependency) {
          graph.update_edge(NodeIndex::new(dep), NodeIndex::new(i), ());
        }
      }
    }

    Self { registry, graph }
  }

  fn name(&self, node: NodeIndex) -> &str {
    self.registry.all()[self.graph[node]].name()
  }

  fn node(&self, name: &str) -> Result<NodeIndex, ResolveError> {
    self
      .registry
      .index_of(name)
      .map(NodeIndex::new)
      .ok_or_else(|| ResolveError::NotFound(name.to_string()))
  }

  /// `targets` plus everything they depend on, transitively. Empty targets
  /// select every project.
  fn closure(&self, targets: &[String]) -> Result<BTreeSet<NodeIndex>, ResolveError> {
    if targets.is_empty() {
      return Ok(self.graph.node_indices().collect());
    }

    let mut selected = BTreeSet::new();
    let mut queue = VecDeque::new();
    for target in targets {
      let node = self.node(target)?;
      if selected.insert(node) {
        queue.push_back(node);
      }
    }
    while let Some(node) = queue.pop_front() {
      for dep in self.graph.neighbors_directed(node, Direction::Incoming) {
        if selected.insert(dep) {
          queue.push_back(dep);
        }
      }
    }

    Ok(selected)
  }

  /// Fail with the shortest cycle touching `selected`, if any.
  fn check_cycles(&self, selected: &BTreeSet<NodeIndex>) -> Result<(), ResolveError> {
    let mut best: Option<Vec<NodeIndex>> = None;

    for component in tarjan_scc(&self.graph) {
      let cyclic = component.len() > 1 || self.graph.contains_edge(component[0], component[0]);
      if !cyclic || !component.iter().any(|n| selected.contains(n)) {
        continue;
      }

      let members: BTreeSet<NodeIndex> = component.into_iter().collect();
      for &start in &members {
        if let Some(cycle) = self.shortest_cycle_from(start, &members)
          && best.as_ref().is_none_or(|b| cycle.len() < b.len())
        {
          best = Some(cycle);
        }
      }
    }

    match best {
      Some(cycle) => Err(ResolveError::Cycle {
        cycle: cycle.into_iter().map(|n| self.name(n).to_string()).collect(),
      }),
      None => Ok(()),
    }
  }

  /// Breadth-first search along "depends on" edges from `start` back to
  /// itself, staying inside `members`.
  fn shortest_cycle_from(&self, start: NodeIndex, members: &BTreeSet<NodeIndex>) -> Option<Vec<NodeIndex>> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
      let mut deps: Vec<NodeIndex> = self
        .graph
        .neighbors_directed(node, Direction::Incoming)
        .filter(|d| members.contains(d))
        .collect();
      deps.sort();

      for dep in deps {
        if dep == start {
          let mut cycle = vec![node];
          let mut current = node;
          while let Some(&p) = parent.get(&current) {
            cycle.push(p);
            current = p;
          }
          cycle.reverse();
          return Some(cycle);
        }
        if dep != start && !parent.contains_key(&dep) {
          parent.insert(dep, node);
          queue.push_back(dep);
        }
      }
    }

    None
  }

  /// Build order for `targets` (all projects when empty): every dependency
  /// precedes its dependents, ties go to the earlier registered project.
  pub fn order(&self, targets: &[String]) -> Result<Vec<String>, ResolveError> {
    let selected = self.closure(targets)?;
    self.check_cycles(&selected)?;

    let mut in_degree: HashMap<NodeIndex, usize> = selected
      .iter()
      .map(|&n| {
        let degree = self
          .graph
          .neighbors_directed(n, Direction::Incoming)
          .filter(|d| selected.contains(d))
          .count();
        (n, degree)
      })
      .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> =
      in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| Reverse(*n)).collect();
    let mut order = Vec::with_capacity(selected.len());

    while let Some(Reverse(node)) = ready.pop() {
      order.push(self.name(node).to_string());
      for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
        if let Some(degree) = in_degree.get_mut(&dependent) {
          *degree -= 1;
          if *degree == 0 {
            ready.push(Reverse(dependent));
          }
        }
      }
    }

    Ok(order)
  }

  /// The order grouped into levels: a project's level is one more than the
  /// highest level among its dependencies.
  pub fn waves(&self, targets: &[String]) -> Result<Vec<Vec<String>>, ResolveError> {
    let order = self.order(targets)?;
    let mut level: HashMap<NodeIndex, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    for name in order {
      let node = self.node(&name)?;
      let wave = self
        .graph
        .neighbors_directed(node, Direction::Incoming)
        .filter_map(|d| level.get(&d))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      level.insert(node, wave);
      if waves.len() <= wave {
        waves.resize_with(wave + 1, Vec::new);
      }
      waves[wave].push(name);
    }

    Ok(waves)
  }

  /// Every project depending on `name`, directly or transitively, in
  /// registration order.
  pub fn dependents_closure(&self, name: &str) -> Result<Vec<String>, ResolveError> {
    let start = self.node(name)?;
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
      for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
        if dependent != start && seen.insert(dependent) {
          queue.push_back(dependent);
        }
      }
    }

    Ok(seen.into_iter().map(|n| self.name(n).to_string()).collect())
  }
}
