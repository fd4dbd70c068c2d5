//! Collaborator interfaces the engine consumes: job persistence, the
//! external execution engine, free-capacity lookup, and trigger
//! registration, together with their in-memory implementations.

pub mod engine;
pub mod resources;
pub mod store;
pub mod triggers;

pub use engine::{EngineError, ExecutionEngine};
pub use resources::{FixedCapacityRegistry, ResourceError, ResourceRegistry};
pub use store::{JobFilter, JobStore, MemoryJobStore, StoreError};
pub use triggers::{MemoryTriggerRegistrar, TriggerError, TriggerRegistrar};
