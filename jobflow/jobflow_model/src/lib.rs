//! Jobflow Data Model
//!
//! Core types of the jobflow orchestration engine: jobs, steps, recursive
//! sequential/parallel step graphs, runtime states with an enforced
//! transition table, and the virtual-unit resource model. This crate is
//! purely data; the compiler and executor live in `jobflow_engine`.

/// Runtime states, transitions, and status records
pub mod status;

/// Execution resources and virtual-unit loads
pub mod load;

/// Steps, step kinds, and input/output sets
pub mod step;

/// Recursive sequential/parallel step graphs
pub mod graph;

/// The job aggregate
pub mod job;

// Re-export important types
pub use graph::{StepExecution, StepGraph};
pub use job::{aggregate_loads, DatasetDescription, Job, JobError, StepUpdateOutcome};
pub use load::{add_load, add_loads, ExecutionResource, Load, LoadMap};
pub use status::{now_millis, Action, RuntimeInfo, RuntimeStatus, State, StatusError};
pub use step::{
    ClusterJob, DelegateRef, ExecutionMode, FunctionStep, InputSet, OutputSet, Provider, Step,
    StepKind,
};
