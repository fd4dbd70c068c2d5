//! Jobflow Engine
//!
//! Orchestrates data-processing jobs described as recursive
//! sequential/parallel step graphs. The compiler fuses a new graph
//! against already-succeeded jobs over the same resource key, sequences
//! it until its load fits the free virtual units, and transforms it into
//! a state-machine definition for an external execution engine. The
//! executor owns the job lifecycle around that: submission, admission,
//! step-status aggregation, cancellation convergence, and resume.

/// Graph fusion, sequencing, and state-machine transformation
pub mod compiler;

/// Engine configuration
pub mod config;

/// The job executor and its background workers
pub mod executor;

/// The step execution protocol
pub mod protocol;

/// Collaborator interfaces and in-memory implementations
pub mod runtime;

// Re-export important types
pub use compiler::{CompileError, GraphTransformer, MachineState, StateMachine};
pub use config::Config;
pub use executor::{ExecutorError, JobCompiler, JobExecutor, PassthroughCompiler};
pub use protocol::{
    AsyncExecutionState, ProtocolError, RequestType, StatusSync, StepFailure, StepHandler,
    StepRegistry, StepRequest, StepRuntime, UnknownState,
};
pub use runtime::{
    EngineError, ExecutionEngine, FixedCapacityRegistry, JobFilter, JobStore, MemoryJobStore,
    MemoryTriggerRegistrar, ResourceError, ResourceRegistry, StoreError, TriggerError,
    TriggerRegistrar,
};
