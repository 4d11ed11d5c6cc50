use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use camino::Utf8PathBuf;

use crate::backend::Backend;
use crate::core::{Options, Resources, Target};
use crate::engine::{Evaluator, Freshness, Plan, Summary};
use crate::error::{ConfigError, FactoryError, KilnError};
use crate::factory::{Factory, Instance, Namespaced};
use crate::graph::DependencyGraph;
use crate::io::{Disk, FileProbe, as_overhead, ensure_parent_dirs, remove_file};

/// The blueprint for a workflow.
///
/// `Blueprint` collects [`Target`]s, either one at a time or stamped out by a
/// [`Factory`] once per parameter record. Registration is all-or-nothing: a
/// call that fails leaves the blueprint exactly as it was.
///
/// Once every target is in, [`Blueprint::finish`] links them into a
/// [`Workflow`].
///
/// # Example
///
/// ```rust
/// use kiln::{Blueprint, Target};
///
/// let mut blueprint = Blueprint::new();
/// blueprint.add(Target::new("download").output("data.csv").run("curl -o data.csv ..."))?;
/// blueprint.add(Target::new("count").input("data.csv").output("count.txt").run("wc -l data.csv > count.txt"))?;
///
/// let workflow = blueprint.finish()?;
/// assert_eq!(workflow.targets().len(), 2);
/// # Ok::<(), kiln::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Blueprint {
    targets: Vec<Target>,
    ids: HashSet<String>,
    defaults: Resources,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resource hints merged under every target registered afterwards. The
    /// target's own hints win.
    pub fn with_defaults(defaults: Resources) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    pub fn defaults(&self) -> &Resources {
        &self.defaults
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn add(&mut self, target: Target) -> Result<(), ConfigError> {
        self.extend([target])
    }

    /// Registers several targets at once, or none of them.
    pub fn extend(&mut self, targets: impl IntoIterator<Item = Target>) -> Result<(), ConfigError> {
        let staged = self.stage(targets)?;
        self.commit(staged);
        Ok(())
    }

    /// Invokes `factory` once per parameter record and registers the
    /// results. If any call fails or collides with an id registered before,
    /// nothing from this call is kept.
    ///
    /// Returns one [`Instance`] per record, in order, so a later aggregating
    /// step can be built from what was registered.
    pub fn instantiate<P, F>(
        &mut self,
        factory: &F,
        records: impl IntoIterator<Item = P>,
    ) -> Result<Vec<Instance>, FactoryError>
    where
        P: Namespaced,
        F: Factory<P> + ?Sized,
    {
        let mut staged: Vec<Target> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut instances = Vec::new();

        for params in records {
            let ns = params.namespace();
            let name = ns.name().to_string();

            let targets = factory
                .build(&params)
                .map_err(|e| FactoryError::Userland(name.clone(), e))?;

            let targets = self
                .check(targets, &mut seen)
                .map_err(|e| FactoryError::Config(name.clone(), e))?;

            tracing::debug!("instantiated {} targets for '{name}'", targets.len());
            instances.push(Instance::new(&name, &targets));
            staged.extend(targets);
        }

        self.commit(staged);
        Ok(instances)
    }

    /// Links the registered targets by their paths and rejects ambiguous
    /// producers and cycles.
    pub fn finish(self) -> Result<Workflow, ConfigError> {
        let s = Instant::now();
        let graph = DependencyGraph::build(&self.targets)?;
        tracing::debug!(
            "Linked {} targets {}",
            self.targets.len(),
            as_overhead(s)
        );

        let index = self
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id().to_string(), i))
            .collect();

        Ok(Workflow {
            targets: self.targets,
            index,
            graph,
        })
    }

    fn stage(&self, targets: impl IntoIterator<Item = Target>) -> Result<Vec<Target>, ConfigError> {
        self.check(targets, &mut HashSet::new())
    }

    /// Validates a group of targets against the registered ones and against
    /// `seen`, the ids staged so far in the same pass.
    fn check(
        &self,
        targets: impl IntoIterator<Item = Target>,
        seen: &mut HashSet<String>,
    ) -> Result<Vec<Target>, ConfigError> {
        let mut checked = Vec::new();

        for target in targets {
            target.validate()?;
            if self.ids.contains(target.id()) || !seen.insert(target.id().to_string()) {
                return Err(ConfigError::DuplicateTarget(target.id().to_string()));
            }
            checked.push(target.apply_defaults(&self.defaults));
        }

        Ok(checked)
    }

    fn commit(&mut self, targets: Vec<Target>) {
        for target in targets {
            self.ids.insert(target.id().to_string());
            self.targets.push(target);
        }
    }
}

/// A validated, linked set of targets.
///
/// The workflow itself is immutable and holds no on-disk state; every call to
/// [`Workflow::plan`], [`Workflow::status`] or [`Workflow::run`] looks at the
/// file system afresh.
#[derive(Debug, Clone)]
pub struct Workflow {
    targets: Vec<Target>,
    index: HashMap<String, usize>,
    graph: DependencyGraph,
}

impl Workflow {
    pub fn design() -> Blueprint {
        Blueprint::default()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn get(&self, id: &str) -> Option<&Target> {
        self.index.get(id).map(|&i| &self.targets[i])
    }

    /// Targets that nothing else depends on.
    pub fn endpoints(&self) -> Vec<&Target> {
        (0..self.targets.len())
            .filter(|&i| self.graph.dependents(i).is_empty())
            .map(|i| &self.targets[i])
            .collect()
    }

    /// Resolves glob patterns over target ids into the set of targets a run
    /// covers: every match plus all of its upstream ancestors. No patterns
    /// select the whole workflow.
    pub fn select<S: AsRef<str>>(&self, patterns: &[S]) -> Result<BTreeSet<usize>, ConfigError> {
        if patterns.is_empty() {
            return Ok((0..self.targets.len()).collect());
        }

        let mut roots = BTreeSet::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();

            if let Some(&i) = self.index.get(pattern) {
                roots.insert(i);
                continue;
            }

            let glob = glob::Pattern::new(pattern).map_err(|e| ConfigError::Pattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
            let matches: Vec<usize> = self
                .targets
                .iter()
                .enumerate()
                .filter(|(_, t)| glob.matches(t.id()))
                .map(|(i, _)| i)
                .collect();

            if matches.is_empty() {
                return Err(if glob::Pattern::escape(pattern) == pattern {
                    ConfigError::UnknownTarget(pattern.to_string())
                } else {
                    ConfigError::EmptySelection(pattern.to_string())
                });
            }
            roots.extend(matches);
        }

        Ok(self.graph.ancestors(roots))
    }

    /// Plans a run against the files below `options.workdir`.
    pub fn plan(&self, options: &Options) -> Result<Plan, KilnError> {
        self.plan_with(&options.select, &Disk::new(&options.workdir))
    }

    /// Plans a run against an arbitrary file probe.
    pub fn plan_with<S: AsRef<str>>(
        &self,
        select: &[S],
        probe: &dyn FileProbe,
    ) -> Result<Plan, KilnError> {
        let s = Instant::now();
        let scope = self.select(select)?;
        let plan = Plan::build(&self.targets, &self.graph, &scope, probe)?;

        tracing::info!(
            "Planned {} of {} targets {}",
            plan.len(),
            scope.len(),
            as_overhead(s)
        );
        Ok(plan)
    }

    /// Whether each selected target would run and why, without submitting
    /// anything. In registration order.
    pub fn status(&self, options: &Options) -> Result<Vec<(&str, Freshness)>, KilnError> {
        let disk = Disk::new(&options.workdir);
        let scope = self.select(&options.select)?;
        let freshness = Evaluator::new(&self.targets, &self.graph, &disk).evaluate(&scope)?;

        Ok(freshness
            .into_iter()
            .map(|(i, state)| (self.targets[i].id(), state))
            .collect())
    }

    /// Plans and executes the selected targets on `backend`.
    ///
    /// Configuration problems abort before anything is submitted. Failing
    /// targets do not: they are reported in the returned [`Summary`] together
    /// with everything they blocked.
    pub fn run(&self, backend: &dyn Backend, options: &Options) -> Result<Summary, KilnError> {
        let s = Instant::now();
        let mut plan = self.plan(options)?;

        crate::engine::run(&self.targets, &mut plan, backend, options)?;

        let mut summary = plan.summary();
        summary.elapsed = s.elapsed();

        if summary.is_success() {
            tracing::info!("Run complete {}", as_overhead(s));
        } else {
            tracing::warn!(
                "Run finished with {} failed and {} blocked targets {}",
                summary.failed().len(),
                summary.blocked().len(),
                as_overhead(s)
            );
        }

        Ok(summary)
    }

    /// Deletes the outputs of the selected targets. Outputs of endpoints are
    /// kept unless `all` is set. Returns the paths that were removed.
    pub fn clean(&self, options: &Options, all: bool) -> Result<Vec<Utf8PathBuf>, KilnError> {
        let disk = Disk::new(&options.workdir);
        let scope = self.select(&options.select)?;
        let mut removed = Vec::new();

        for i in scope {
            if !all && self.graph.dependents(i).is_empty() {
                continue;
            }
            for path in self.targets[i].outputs() {
                if remove_file(&disk, path)? {
                    tracing::debug!("removed {path}");
                    removed.push(path.clone());
                }
            }
        }

        tracing::info!("Removed {} files", removed.len());
        Ok(removed)
    }

    /// Creates the parent directory of every output. Never makes a target
    /// fresh, since a directory does not count as a produced file.
    pub fn create_output_dirs(&self, options: &Options) -> Result<(), KilnError> {
        let disk = Disk::new(&options.workdir);
        ensure_parent_dirs(&disk, self.targets.iter().flat_map(Target::outputs))?;
        Ok(())
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for (i, target) in self.targets.iter().enumerate() {
            let name = target.id().replace('"', "\\\"");
            writeln!(f, "    {i}[\"{name}\"]")?;
        }

        for (source, target, path) in self.graph.edges() {
            let path = path.as_str().replace('"', "\\\"");
            writeln!(f, "    {source} -- \"{path}\" --> {target}")?;
        }

        Ok(())
    }
}
