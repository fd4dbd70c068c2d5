use crate::compiler::transform::StateMachine;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error type for calls into the external execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid or stale completion token")]
    InvalidToken,

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Other engine error: {0}")]
    Other(String),
}

/// The external state-machine execution engine. It runs compiled
/// definitions verbatim and invokes each task state's step through the
/// step execution protocol, handing out an opaque completion token per
/// activation.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + 'static {
    /// Register a compiled definition, returning the execution handle
    async fn create_execution(&self, definition: &StateMachine) -> Result<String, EngineError>;

    /// Start a previously created execution
    async fn start_execution(&self, execution_id: &str) -> Result<(), EngineError>;

    /// Ask a running execution to stop
    async fn stop_execution(&self, execution_id: &str) -> Result<(), EngineError>;

    /// Re-drive an existing execution from its failed or cancelled
    /// states, keeping already-succeeded states untouched
    async fn redrive_execution(&self, execution_id: &str) -> Result<(), EngineError>;

    /// Drop an execution and its history
    async fn delete_execution(&self, execution_id: &str) -> Result<(), EngineError>;

    /// Signal liveness for a wait-for-completion task. Fails with
    /// `InvalidToken` when the engine no longer accepts the token.
    async fn send_heartbeat(&self, token: &str) -> Result<(), EngineError>;

    /// Complete a wait-for-completion task successfully
    async fn send_success(&self, token: &str, payload: Value) -> Result<(), EngineError>;

    /// Fail a wait-for-completion task
    async fn send_failure(
        &self,
        token: &str,
        error: &str,
        cause: Option<&str>,
    ) -> Result<(), EngineError>;
}
