//! Deciding what has to run, in which order, and running it.

mod plan;
mod runner;
mod staleness;
mod summary;

pub use crate::engine::plan::Plan;
pub use crate::engine::staleness::{Freshness, StaleReason};
pub use crate::engine::summary::{Entry, Status, Summary};

pub(crate) use crate::engine::runner::run;
pub(crate) use crate::engine::staleness::Evaluator;
