#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod backend;
mod blueprint;
mod core;
mod engine;
mod error;
mod factory;
mod graph;
mod io;
mod utils;

pub use crate::backend::{Backend, Exit, Job, Local, Outcome, Slurm};
pub use crate::blueprint::{Blueprint, Workflow};
pub use crate::core::{Memory, Options, Resources, Target, TargetDef, Walltime};
pub use crate::engine::{Entry, Freshness, Plan, StaleReason, Status, Summary};
pub use crate::error::*;
pub use crate::factory::{Factory, Instance, Namespace, Namespaced, Params, Registered};
pub use crate::graph::{DependencyGraph, PathEntry};
pub use crate::io::{Disk, FileProbe};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
