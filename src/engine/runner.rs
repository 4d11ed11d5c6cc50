use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{Level, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::backend::{Backend, Job, Outcome};
use crate::core::{Options, Target};
use crate::engine::Plan;
use crate::error::KilnError;
use crate::io::{Disk, as_overhead, ensure_parent_dirs, remove_file};
use crate::utils::{STYLE_BATCHES, STYLE_TARGET};

/// Drives a plan to completion.
///
/// The loop works in batches:
/// 1. Ask the plan for every target whose dependencies have succeeded.
/// 2. Submit the whole batch, concurrently on the rayon pool or one after
///    another.
/// 3. Wait for all of them, then feed the outcomes back, which blocks the
///    dependents of anything that failed.
/// 4. Repeat until the plan hands out nothing.
///
/// A failing target never aborts the loop, only `Err` from misuse of the plan
/// does.
pub(crate) fn run(
    targets: &[Target],
    plan: &mut Plan,
    backend: &dyn Backend,
    options: &Options,
) -> Result<(), KilnError> {
    if plan.is_empty() {
        tracing::info!("Nothing to do, every selected target is up to date");
        return Ok(());
    }

    if options.dry_run {
        for id in plan.scheduled() {
            if let Some(reason) = plan.reason(id) {
                tracing::info!("would run {id}: {reason}");
            }
        }
        return Ok(());
    }

    let root_span = tracing::span!(Level::INFO, "running_targets", backend = backend.name());
    root_span.pb_set_length(plan.len() as u64);
    root_span.pb_set_style(&STYLE_BATCHES);
    root_span.pb_set_message("Running targets...");
    let _enter = root_span.enter();

    let disk = Disk::new(&options.workdir);
    let mut batch_no = 0;

    loop {
        let batch = plan.next_ready();
        if batch.is_empty() {
            break;
        }

        batch_no += 1;
        let s = Instant::now();
        tracing::debug!(batch = batch_no, size = batch.len(), "dispatching");

        let submit = |&i: &usize| (i, execute(&targets[i], backend, &disk, options, &root_span));
        let results: Vec<(usize, (Outcome, Duration))> = if options.parallel {
            batch.par_iter().map(submit).collect()
        } else {
            batch.iter().map(submit).collect()
        };

        for (i, (outcome, duration)) in results {
            root_span.pb_inc(1);
            for blocked in plan.complete(i, outcome, Some(duration))? {
                root_span.pb_inc(1);
                tracing::warn!(
                    "{} blocked, upstream {} failed",
                    targets[blocked].id(),
                    targets[i].id()
                );
            }
        }

        tracing::info!("Finished batch {batch_no} {}", as_overhead(s));
    }

    Ok(())
}

fn execute(
    target: &Target,
    backend: &dyn Backend,
    disk: &Disk,
    options: &Options,
    parent: &Span,
) -> (Outcome, Duration) {
    let span = tracing::span!(parent: parent, Level::INFO, "target", id = target.id());
    span.pb_set_style(&STYLE_TARGET);
    span.pb_set_message(&format!("Running {}", target.id()));
    let _enter = span.enter();

    let start = Instant::now();

    if options.create_dirs
        && let Err(e) = ensure_parent_dirs(disk, target.outputs())
    {
        let outcome = Outcome::submission_error(format!("cannot create output directories: {e}"));
        tracing::warn!("{} {outcome}", target.id());
        discard_outputs(target, disk);
        return (outcome, start.elapsed());
    }

    let job = Job {
        id: target.id(),
        command: target.command(),
        resources: target.resources(),
        workdir: disk.root(),
    };

    // Backends only see borrowed, immutable data, so a panic cannot leave
    // anything shared in a broken state.
    let outcome = match catch_unwind(AssertUnwindSafe(|| backend.submit(&job))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("backend panicked: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("backend panicked: {s}")
            } else {
                String::from("backend panicked with unknown payload")
            };
            Outcome::submission_error(msg)
        }
    };

    let duration = start.elapsed();

    if outcome.is_success() {
        tracing::info!("{} {outcome} {}", target.id(), as_overhead(start));
    } else {
        tracing::warn!("{} {outcome} {}", target.id(), as_overhead(start));
        discard_outputs(target, disk);
    }

    (outcome, duration)
}

/// Deletes whatever a failed target left behind, so a half-written output is
/// never mistaken for a fresh one on the next run.
fn discard_outputs(target: &Target, disk: &Disk) {
    for path in target.outputs() {
        match remove_file(disk, path) {
            Ok(true) => tracing::debug!(id = target.id(), %path, "removed output of failed target"),
            Ok(false) => {}
            Err(e) => tracing::warn!("{}: cannot remove output '{path}': {e}", target.id()),
        }
    }
}
