//! The graph compiler: fusion against prior jobs, sequencing against the
//! resource budget, and transformation into an executable definition.

pub mod fusion;
pub mod sequencing;
pub mod transform;

pub use transform::{CompileError, GraphTransformer, MachineState, StateMachine};
