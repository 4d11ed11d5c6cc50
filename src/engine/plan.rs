use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use crate::backend::Outcome;
use crate::core::Target;
use crate::engine::staleness::{Evaluator, Freshness, StaleReason};
use crate::engine::summary::{Entry, Status, Summary};
use crate::error::{ConfigError, KilnError, PlanError};
use crate::graph::DependencyGraph;
use crate::io::FileProbe;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Not selected for this run.
    Outside,
    Fresh,
    Pending,
    Dispatched,
    Done(Outcome, Option<Duration>),
    /// Holds the index of the failed target that caused the block.
    Blocked(usize),
}

/// The run order for one invocation.
///
/// Covers exactly the stale targets of the selection. Targets are handed out
/// in batches whose members have every scheduled dependency completed
/// successfully; outcomes are fed back with [`Plan::mark_complete`], which
/// either unlocks downstream targets or blocks all of them.
#[derive(Debug, Clone)]
pub struct Plan {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    slots: Vec<Slot>,
    reasons: Vec<Option<StaleReason>>,
    /// Scheduled dependencies of each target.
    deps: Vec<Vec<usize>>,
    /// Scheduled dependents of each target.
    dependents: Vec<Vec<usize>>,
    /// Scheduled targets in topological order.
    order: Vec<usize>,
}

impl Plan {
    /// Checks external inputs, evaluates staleness over `scope` and lays out
    /// the stale targets. `scope` must be closed under dependencies.
    pub(crate) fn build(
        targets: &[Target],
        graph: &DependencyGraph,
        scope: &BTreeSet<usize>,
        probe: &dyn FileProbe,
    ) -> Result<Self, KilnError> {
        let mut evaluator = Evaluator::new(targets, graph, probe);

        for &i in scope {
            let target = &targets[i];
            for path in target.inputs() {
                if graph.is_external(path) && evaluator.mtime(path)?.is_none() {
                    return Err(ConfigError::DanglingInput {
                        target: target.id().to_string(),
                        path: path.clone(),
                    }
                    .into());
                }
            }
        }

        let freshness = evaluator.evaluate(scope)?;

        let mut slots = vec![Slot::Outside; targets.len()];
        let mut reasons = vec![None; targets.len()];
        for (i, state) in freshness {
            slots[i] = match state {
                Freshness::Fresh => Slot::Fresh,
                Freshness::Stale(reason) => {
                    reasons[i] = Some(reason);
                    Slot::Pending
                }
            };
        }

        let scheduled = |i: &usize| slots[*i] == Slot::Pending;
        let mut deps = vec![Vec::new(); targets.len()];
        let mut dependents = vec![Vec::new(); targets.len()];
        for i in (0..targets.len()).filter(scheduled) {
            deps[i] = graph.dependencies(i).into_iter().filter(scheduled).collect();
            dependents[i] = graph.dependents(i).into_iter().filter(scheduled).collect();
        }

        let order = graph.topological().iter().copied().filter(scheduled).collect();

        let ids: Vec<String> = targets.iter().map(|t| t.id().to_string()).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

        Ok(Self {
            ids,
            index,
            slots,
            reasons,
            deps,
            dependents,
            order,
        })
    }

    /// Number of targets that are going to run.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ids of the scheduled targets in a valid run order.
    pub fn scheduled(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Why a scheduled target has to run.
    pub fn reason(&self, id: &str) -> Option<&StaleReason> {
        self.index.get(id).and_then(|&i| self.reasons[i].as_ref())
    }

    /// The full batch sequence assuming every target succeeds. A target lands
    /// in the batch right after its deepest scheduled dependency.
    pub fn batches(&self) -> Vec<Vec<&str>> {
        let mut layer: HashMap<usize, usize> = HashMap::new();
        let mut batches: Vec<Vec<usize>> = Vec::new();

        for &i in &self.order {
            let depth = self.deps[i]
                .iter()
                .filter_map(|dep| layer.get(dep))
                .map(|depth| depth + 1)
                .max()
                .unwrap_or(0);
            layer.insert(i, depth);

            if batches.len() <= depth {
                batches.resize_with(depth + 1, Vec::new);
            }
            batches[depth].push(i);
        }

        batches
            .into_iter()
            .map(|mut batch| {
                batch.sort_unstable();
                batch.into_iter().map(|i| self.ids[i].as_str()).collect()
            })
            .collect()
    }

    /// Hands out every target whose scheduled dependencies have all
    /// succeeded and marks them as dispatched. Empty when nothing more can
    /// start until outstanding targets are reported.
    pub fn next_batch(&mut self) -> Vec<String> {
        self.next_ready()
            .into_iter()
            .map(|i| self.ids[i].clone())
            .collect()
    }

    pub(crate) fn next_ready(&mut self) -> Vec<usize> {
        let mut ready: Vec<usize> = self
            .order
            .iter()
            .copied()
            .filter(|&i| self.slots[i] == Slot::Pending)
            .filter(|&i| {
                self.deps[i]
                    .iter()
                    .all(|&dep| matches!(self.slots[dep], Slot::Done(Outcome::Succeeded, _)))
            })
            .collect();
        ready.sort_unstable();

        for &i in &ready {
            self.slots[i] = Slot::Dispatched;
        }
        ready
    }

    /// Records the outcome of a dispatched target. On failure every pending
    /// transitive dependent is blocked; their ids are returned.
    pub fn mark_complete(&mut self, id: &str, outcome: Outcome) -> Result<Vec<String>, PlanError> {
        let &i = self
            .index
            .get(id)
            .ok_or_else(|| PlanError::NotPlanned(id.to_string()))?;

        let blocked = self.complete(i, outcome, None)?;
        Ok(blocked.into_iter().map(|b| self.ids[b].clone()).collect())
    }

    pub(crate) fn complete(
        &mut self,
        i: usize,
        outcome: Outcome,
        duration: Option<Duration>,
    ) -> Result<Vec<usize>, PlanError> {
        match self.slots[i] {
            Slot::Dispatched => {}
            Slot::Done(..) => return Err(PlanError::AlreadyComplete(self.ids[i].clone())),
            Slot::Pending | Slot::Blocked(_) => {
                return Err(PlanError::NotDispatched(self.ids[i].clone()));
            }
            Slot::Outside | Slot::Fresh => return Err(PlanError::NotPlanned(self.ids[i].clone())),
        }

        let failed = !outcome.is_success();
        self.slots[i] = Slot::Done(outcome, duration);

        if !failed {
            return Ok(Vec::new());
        }

        let mut blocked = Vec::new();
        let mut queue: VecDeque<usize> = self.dependents[i].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.slots[next] == Slot::Pending {
                self.slots[next] = Slot::Blocked(i);
                blocked.push(next);
                queue.extend(self.dependents[next].iter().copied());
            }
        }

        blocked.sort_unstable();
        Ok(blocked)
    }

    /// Nothing is waiting to be dispatched or reported.
    pub fn is_finished(&self) -> bool {
        !self
            .slots
            .iter()
            .any(|slot| matches!(slot, Slot::Pending | Slot::Dispatched))
    }

    /// Per-target report of the current state, in registration order.
    /// Targets that were never dispatched count as not reached.
    pub fn summary(&self) -> Summary {
        let entries = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| {
                let (status, duration) = match slot {
                    Slot::Fresh => (Status::SkippedFresh, None),
                    Slot::Done(Outcome::Succeeded, duration) => (Status::RanSucceeded, *duration),
                    Slot::Done(outcome, duration) => (
                        Status::RanFailed {
                            outcome: outcome.clone(),
                        },
                        *duration,
                    ),
                    Slot::Blocked(upstream) => (
                        Status::BlockedByUpstreamFailure {
                            upstream: self.ids[*upstream].clone(),
                        },
                        None,
                    ),
                    Slot::Outside | Slot::Pending | Slot::Dispatched => (Status::NotReached, None),
                };

                Entry {
                    id: self.ids[i].clone(),
                    status,
                    reason: self.reasons[i].clone(),
                    duration,
                }
            })
            .collect();

        Summary {
            entries,
            elapsed: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Exit;
    use crate::io::memory::MemoryFs;

    fn target(id: &str, inputs: &[&str], outputs: &[&str]) -> Target {
        Target::new(id)
            .inputs(inputs.iter().copied())
            .outputs(outputs.iter().copied())
            .run(format!("run {id}"))
    }

    fn chain() -> Vec<Target> {
        vec![
            target("T1", &[], &["a.txt"]),
            target("T2", &["a.txt"], &["b.txt"]),
            target("T3", &["b.txt"], &["c.txt"]),
        ]
    }

    fn plan(targets: &[Target], fs: &MemoryFs) -> Result<Plan, KilnError> {
        let graph = DependencyGraph::build(targets).unwrap();
        let scope = (0..targets.len()).collect();
        Plan::build(targets, &graph, &scope, fs)
    }

    fn failed() -> Outcome {
        Outcome::Failed {
            exit: Exit::Code(1),
        }
    }

    #[test]
    fn test_chain_batches() {
        let plan = plan(&chain(), &MemoryFs::new()).unwrap();

        assert_eq!(plan.batches(), vec![vec!["T1"], vec!["T2"], vec!["T3"]]);
        assert_eq!(
            plan.reason("T1"),
            Some(&StaleReason::MissingOutput {
                path: "a.txt".into()
            })
        );
    }

    #[test]
    fn test_chain_dispatch_order() {
        let mut plan = plan(&chain(), &MemoryFs::new()).unwrap();

        assert_eq!(plan.next_batch(), vec!["T1"]);
        assert!(plan.next_batch().is_empty());
        plan.mark_complete("T1", Outcome::Succeeded).unwrap();
        assert_eq!(plan.next_batch(), vec!["T2"]);
        plan.mark_complete("T2", Outcome::Succeeded).unwrap();
        assert_eq!(plan.next_batch(), vec!["T3"]);
        let blocked = plan.mark_complete("T3", failed()).unwrap();

        assert!(blocked.is_empty());
        assert!(plan.is_finished());

        let summary = plan.summary();
        assert_eq!(summary.get("T1"), Some(&Status::RanSucceeded));
        assert_eq!(summary.failed(), vec!["T3"]);
        assert!(summary.blocked().is_empty());
    }

    #[test]
    fn test_diamond_batches() {
        let targets = vec![
            target("root", &[], &["r"]),
            target("left", &["r"], &["l"]),
            target("right", &["r"], &["x"]),
            target("join", &["l", "x"], &["j"]),
            target("lone", &[], &["o"]),
        ];

        let plan = plan(&targets, &MemoryFs::new()).unwrap();

        assert_eq!(
            plan.batches(),
            vec![vec!["root", "lone"], vec!["left", "right"], vec!["join"]]
        );
    }

    #[test]
    fn test_every_target_planned_once() {
        let targets = vec![
            target("a", &[], &["a"]),
            target("b", &["a"], &["b"]),
            target("c", &["a", "b"], &["c"]),
            target("d", &["c"], &["d"]),
            target("e", &["a", "d"], &["e"]),
        ];

        let plan = plan(&targets, &MemoryFs::new()).unwrap();
        let mut seen: Vec<&str> = plan.batches().into_iter().flatten().collect();
        seen.sort_unstable();

        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(plan.len(), 5);
    }

    #[test]
    fn test_failure_blocks_descendants_only() {
        let targets = vec![
            target("src", &[], &["s"]),
            target("mid", &["s"], &["m"]),
            target("end", &["m"], &["e"]),
            target("side", &[], &["x"]),
            target("side_end", &["x"], &["y"]),
        ];
        let mut plan = plan(&targets, &MemoryFs::new()).unwrap();

        assert_eq!(plan.next_batch(), vec!["src", "side"]);
        let blocked = plan.mark_complete("src", failed()).unwrap();
        plan.mark_complete("side", Outcome::Succeeded).unwrap();

        assert_eq!(blocked, vec!["mid", "end"]);
        assert_eq!(plan.next_batch(), vec!["side_end"]);
        plan.mark_complete("side_end", Outcome::Succeeded).unwrap();
        assert!(plan.next_batch().is_empty());
        assert!(plan.is_finished());

        let summary = plan.summary();
        assert_eq!(
            summary.get("end"),
            Some(&Status::BlockedByUpstreamFailure {
                upstream: "src".into()
            })
        );
        assert_eq!(summary.ran(), vec!["src", "side", "side_end"]);
    }

    #[test]
    fn test_fresh_workflow_plans_nothing() {
        let fs = MemoryFs::new();
        fs.touch("a.txt", 10);
        fs.touch("b.txt", 20);
        fs.touch("c.txt", 30);

        let mut plan = plan(&chain(), &fs).unwrap();

        assert!(plan.is_empty());
        assert!(plan.next_batch().is_empty());
        assert!(plan.is_finished());
        assert_eq!(plan.summary().count(|s| *s == Status::SkippedFresh), 3);
    }

    #[test]
    fn test_deleted_output_replans_descendants() {
        let targets = vec![
            target("T1", &[], &["a.txt"]),
            target("T2", &["a.txt"], &["b.txt"]),
            target("T3", &["b.txt"], &["c.txt"]),
            target("U1", &[], &["u.txt"]),
            target("U2", &["u.txt"], &["v.txt"]),
        ];
        let fs = MemoryFs::new();
        for (path, time) in [("a.txt", 1), ("b.txt", 2), ("c.txt", 3), ("u.txt", 1), ("v.txt", 2)] {
            fs.touch(path, time);
        }
        fs.remove("b.txt");

        let plan = plan(&targets, &fs).unwrap();

        assert_eq!(plan.scheduled(), vec!["T2", "T3"]);
    }

    #[test]
    fn test_dangling_input_rejected() {
        let targets = vec![target("use", &["ref/missing.bim"], &["out"])];

        let err = plan(&targets, &MemoryFs::new()).unwrap_err();

        assert!(matches!(
            err,
            KilnError::Config(ConfigError::DanglingInput { ref target, .. }) if target == "use"
        ));
    }

    #[test]
    fn test_present_external_input_is_fine() {
        let targets = vec![target("use", &["ref/present.bim"], &["out"])];
        let fs = MemoryFs::new();
        fs.touch("ref/present.bim", 5);

        let plan = plan(&targets, &fs).unwrap();

        assert_eq!(plan.scheduled(), vec!["use"]);
    }

    #[test]
    fn test_out_of_scope_is_not_reached() {
        let targets = vec![
            target("s1", &[], &["s1.txt"]),
            target("s2", &[], &["s2.txt"]),
        ];
        let graph = DependencyGraph::build(&targets).unwrap();
        let scope = BTreeSet::from([0]);

        let mut plan = Plan::build(&targets, &graph, &scope, &MemoryFs::new()).unwrap();

        assert_eq!(plan.next_batch(), vec!["s1"]);
        assert_eq!(plan.summary().get("s2"), Some(&Status::NotReached));
        assert_eq!(
            plan.mark_complete("s2", Outcome::Succeeded),
            Err(PlanError::NotPlanned("s2".into()))
        );
    }

    #[test]
    fn test_mark_complete_misuse() {
        let mut plan = plan(&chain(), &MemoryFs::new()).unwrap();

        assert_eq!(
            plan.mark_complete("T2", Outcome::Succeeded),
            Err(PlanError::NotDispatched("T2".into()))
        );
        assert_eq!(
            plan.mark_complete("nope", Outcome::Succeeded),
            Err(PlanError::NotPlanned("nope".into()))
        );

        plan.next_batch();
        plan.mark_complete("T1", Outcome::Succeeded).unwrap();
        assert_eq!(
            plan.mark_complete("T1", Outcome::Succeeded),
            Err(PlanError::AlreadyComplete("T1".into()))
        );
    }
}
