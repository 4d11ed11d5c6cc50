//! Derivation of the dependency DAG from file paths.
//!
//! Targets never name each other. An edge from producer `P` to consumer `C`
//! exists whenever one of `P`'s outputs is literally one of `C`'s inputs
//! (after lexical normalization). Paths that nobody produces are external
//! inputs and link nothing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::core::Target;
use crate::error::ConfigError;

/// Who produces and who consumes a single path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathEntry {
    pub producer: Option<usize>,
    pub consumers: Vec<usize>,
}

/// The DAG over target indices. Node `i` is the `i`-th registered target.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, Utf8PathBuf>,
    index: BTreeMap<Utf8PathBuf, PathEntry>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Builds the path index and the edges, rejecting ambiguous producers and
    /// cycles.
    pub fn build(targets: &[Target]) -> Result<Self, ConfigError> {
        let mut graph = DiGraph::with_capacity(targets.len(), targets.len());
        let mut index: BTreeMap<Utf8PathBuf, PathEntry> = BTreeMap::new();

        for target in targets {
            graph.add_node(target.id().to_string());
        }

        // first pass: producers
        for (i, target) in targets.iter().enumerate() {
            for path in target.outputs() {
                let entry = index.entry(path.clone()).or_default();
                if let Some(first) = entry.producer {
                    return Err(ConfigError::DuplicateOutput {
                        path: path.clone(),
                        first: targets[first].id().to_string(),
                        second: target.id().to_string(),
                    });
                }
                entry.producer = Some(i);
            }
        }

        // second pass: consumers and edges
        for (i, target) in targets.iter().enumerate() {
            for path in target.inputs() {
                let entry = index.entry(path.clone()).or_default();
                if !entry.consumers.contains(&i) {
                    entry.consumers.push(i);
                }
                if let Some(producer) = entry.producer {
                    graph.add_edge(NodeIndex::new(producer), NodeIndex::new(i), path.clone());
                }
            }
        }

        let order = match petgraph::algo::toposort(&graph, None) {
            Ok(order) => order.into_iter().map(NodeIndex::index).collect(),
            Err(_) => {
                let cycle = find_cycle(&graph).unwrap_or_default();
                return Err(ConfigError::Cycle(
                    cycle.into_iter().map(|i| graph[NodeIndex::new(i)].clone()).collect(),
                ));
            }
        };

        Ok(Self {
            graph,
            index,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Every referenced path with its producer and consumers.
    pub fn paths(&self) -> &BTreeMap<Utf8PathBuf, PathEntry> {
        &self.index
    }

    pub fn producer(&self, path: &Utf8Path) -> Option<usize> {
        self.index.get(path).and_then(|entry| entry.producer)
    }

    pub fn is_external(&self, path: &Utf8Path) -> bool {
        self.producer(path).is_none()
    }

    /// All target indices in a valid topological order.
    pub fn topological(&self) -> &[usize] {
        &self.order
    }

    /// Direct upstream targets, sorted and deduplicated.
    pub fn dependencies(&self, target: usize) -> Vec<usize> {
        self.neighbors(target, Direction::Incoming)
    }

    /// Direct downstream targets, sorted and deduplicated.
    pub fn dependents(&self, target: usize) -> Vec<usize> {
        self.neighbors(target, Direction::Outgoing)
    }

    /// Roots plus everything reachable upstream from them.
    pub fn ancestors(&self, roots: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        self.closure(roots, Direction::Incoming)
    }

    /// Roots plus everything reachable downstream from them.
    pub fn descendants(&self, roots: impl IntoIterator<Item = usize>) -> BTreeSet<usize> {
        self.closure(roots, Direction::Outgoing)
    }

    /// Edges as `(producer, consumer, path)` triples.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, &Utf8PathBuf)> {
        self.graph.edge_indices().filter_map(|edge| {
            let (source, target) = self.graph.edge_endpoints(edge)?;
            Some((source.index(), target.index(), &self.graph[edge]))
        })
    }

    fn neighbors(&self, target: usize, direction: Direction) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(target), direction)
            .map(NodeIndex::index)
            .collect();
        found.sort_unstable();
        found.dedup();
        found
    }

    fn closure(
        &self,
        roots: impl IntoIterator<Item = usize>,
        direction: Direction,
    ) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = roots.into_iter().collect();

        while let Some(next) = queue.pop_front() {
            if seen.insert(next) {
                queue.extend(self.neighbors(next, direction));
            }
        }

        seen
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Depth-first search with an in-progress marker. Returns the first cycle
/// found as a sequence of node indices, starting and ending on the same node.
fn find_cycle<N, E>(graph: &DiGraph<N, E>) -> Option<Vec<usize>> {
    let sorted = |node: NodeIndex| {
        let mut next: Vec<usize> = graph.neighbors(node).map(NodeIndex::index).collect();
        next.sort_unstable();
        next.dedup();
        next
    };

    let mut marks = vec![Mark::Unvisited; graph.node_count()];

    for start in 0..graph.node_count() {
        if marks[start] != Mark::Unvisited {
            continue;
        }

        // (node, its successors, position of the next successor to visit)
        let mut stack: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        marks[start] = Mark::InProgress;
        stack.push((start, sorted(NodeIndex::new(start)), 0));

        while let Some((node, next, pos)) = stack.last_mut() {
            let Some(&succ) = next.get(*pos) else {
                marks[*node] = Mark::Done;
                stack.pop();
                continue;
            };
            *pos += 1;

            match marks[succ] {
                Mark::Done => {}
                Mark::InProgress => {
                    let from = stack.iter().position(|(n, _, _)| *n == succ)?;
                    let mut cycle: Vec<usize> = stack[from..].iter().map(|(n, _, _)| *n).collect();
                    cycle.push(succ);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    marks[succ] = Mark::InProgress;
                    stack.push((succ, sorted(NodeIndex::new(succ)), 0));
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: &str, inputs: &[&str], outputs: &[&str]) -> Target {
        Target::new(id)
            .inputs(inputs.iter().copied())
            .outputs(outputs.iter().copied())
            .run(format!("run {id}"))
    }

    #[test]
    fn test_edges_follow_paths() {
        let targets = vec![
            target("t1", &[], &["a.txt"]),
            target("t2", &["a.txt"], &["b.txt"]),
            target("t3", &["b.txt", "a.txt"], &["c.txt"]),
        ];

        let graph = DependencyGraph::build(&targets).unwrap();

        assert_eq!(graph.dependencies(0), Vec::<usize>::new());
        assert_eq!(graph.dependencies(2), vec![0, 1]);
        assert_eq!(graph.dependents(0), vec![1, 2]);
        assert_eq!(graph.topological(), &[0, 1, 2]);
        assert_eq!(graph.producer(Utf8Path::new("b.txt")), Some(1));
        assert_eq!(graph.paths()[Utf8Path::new("a.txt")].consumers, vec![1, 2]);
    }

    #[test]
    fn test_shared_external_input_links_nothing() {
        let targets = vec![
            target("left", &["ref.bim"], &["l.txt"]),
            target("right", &["ref.bim"], &["r.txt"]),
        ];

        let graph = DependencyGraph::build(&targets).unwrap();

        assert!(graph.is_external(Utf8Path::new("ref.bim")));
        assert!(graph.dependents(0).is_empty());
        assert!(graph.dependents(1).is_empty());
        assert_eq!(graph.edges().count(), 0);
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let targets = vec![
            target("first", &[], &["same.txt"]),
            target("second", &[], &["./same.txt"]),
        ];

        let err = DependencyGraph::build(&targets).unwrap_err();

        assert_eq!(
            err,
            ConfigError::DuplicateOutput {
                path: "same.txt".into(),
                first: "first".into(),
                second: "second".into(),
            }
        );
    }

    #[test]
    fn test_two_node_cycle_names_both() {
        let targets = vec![
            target("A", &["b.txt"], &["a.txt"]),
            target("B", &["a.txt"], &["b.txt"]),
        ];

        let err = DependencyGraph::build(&targets).unwrap_err();

        assert_eq!(err, ConfigError::Cycle(vec!["A".into(), "B".into(), "A".into()]));
        assert!(err.to_string().contains("A -> B -> A"));
    }

    #[test]
    fn test_cycle_reports_only_the_loop() {
        let targets = vec![
            target("entry", &[], &["e"]),
            target("x", &["e", "z"], &["x"]),
            target("y", &["x"], &["y"]),
            target("z", &["y"], &["z"]),
        ];

        let err = DependencyGraph::build(&targets).unwrap_err();

        assert_eq!(
            err,
            ConfigError::Cycle(vec!["x".into(), "y".into(), "z".into(), "x".into()])
        );
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let targets = vec![target("me", &["me.txt"], &["me.txt"])];

        let err = DependencyGraph::build(&targets).unwrap_err();

        assert_eq!(err, ConfigError::Cycle(vec!["me".into(), "me".into()]));
    }

    #[test]
    fn test_closures() {
        let targets = vec![
            target("a", &[], &["a"]),
            target("b", &["a"], &["b"]),
            target("c", &["b"], &["c"]),
            target("d", &[], &["d"]),
        ];

        let graph = DependencyGraph::build(&targets).unwrap();

        assert_eq!(graph.ancestors([2]), BTreeSet::from([0, 1, 2]));
        assert_eq!(graph.descendants([1]), BTreeSet::from([1, 2]));
        assert_eq!(graph.descendants([3]), BTreeSet::from([3]));
    }
}
