//! The step execution protocol: the contract every step implementation
//! fulfills at runtime. The external engine invokes task states through
//! requests carrying a completion token; the step runtime dispatches them
//! to the registered handler, drives heartbeats and state checks for
//! asynchronous steps, and mirrors status into the owning job.

use crate::runtime::engine::{EngineError, ExecutionEngine};
use crate::runtime::store::StoreError;
use crate::runtime::triggers::{TriggerError, TriggerRegistrar};
use async_trait::async_trait;
use jobflow_model::{ExecutionMode, State, StatusError, Step, StepKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error type for the step runtime
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("No handler registered for step kind: {0}")]
    NoHandler(String),

    #[error("Step {0} is a delegation and must not be executed")]
    NotExecutable(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A structured step failure, carrying the diagnostics recorded on the
/// step status. The retryable flag is explicit where the step knows, and
/// left to the handler's classification hook otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailure {
    pub message: String,
    pub cause: Option<String>,
    pub code: Option<String>,
    pub retryable: Option<bool>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        StepFailure {
            message: message.into(),
            cause: None,
            code: None,
            retryable: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Remote state of an asynchronously executing step
#[derive(Debug, Clone)]
pub enum AsyncExecutionState {
    Running,
    Succeeded,
    Failed(StepFailure),
}

/// The remote state could not be determined. Swallowed by the state
/// check; the engine's heartbeat timeout is the backstop when the
/// condition persists.
#[derive(Debug, Clone, Copy)]
pub struct UnknownState;

/// The contract a step implementation fulfills. One handler is registered
/// per dispatchable step kind.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Run the business logic once. For SYNC steps the work is done when
    /// this returns; for ASYNC steps it only means the remote process was
    /// started.
    async fn execute(&self, step: &Step) -> Result<(), StepFailure>;

    /// Re-run after a resume. Defaults to a plain execute.
    async fn resume(&self, step: &Step) -> Result<(), StepFailure> {
        self.execute(step).await
    }

    /// Stop a running execution
    async fn cancel(&self, step: &Step) -> Result<(), StepFailure>;

    /// Whether the step is ready to execute (all required inputs present)
    async fn validate(&self, step: &Step) -> Result<bool, StepFailure>;

    /// Amend the step's configuration before submission
    async fn prepare(&self, _step: &mut Step) -> Result<(), StepFailure> {
        Ok(())
    }

    /// Query the remote state of an asynchronous execution
    async fn execution_state(&self, step: &Step) -> Result<AsyncExecutionState, UnknownState>;

    /// Classify a failure that carries no explicit retryable flag
    fn classify_failure(&self, _failure: &StepFailure) -> bool {
        false
    }

    /// Finalization hook invoked once the execution succeeded, before the
    /// success is reported
    async fn on_success(&self, _step: &Step) -> Result<(), StepFailure> {
        Ok(())
    }
}

/// Dispatch table mapping step kinds to their handlers
#[derive(Default)]
pub struct StepRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn StepHandler>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        StepRegistry::default()
    }

    /// The dispatch key of a step: function steps dispatch by handler
    /// name, cluster jobs by kind. Delegations have none.
    pub fn dispatch_key(step: &Step) -> Option<String> {
        match &step.kind {
            StepKind::Function(function) => Some(function.handler.clone()),
            StepKind::ClusterJob(_) => Some("ClusterJob".to_string()),
            StepKind::Delegate(_) => None,
        }
    }

    pub async fn register(&self, key: &str, handler: Arc<dyn StepHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(key.to_string(), handler);
    }

    pub async fn resolve(&self, step: &Step) -> Result<Arc<dyn StepHandler>, ProtocolError> {
        let key = Self::dispatch_key(step)
            .ok_or_else(|| ProtocolError::NotExecutable(step.global_id()))?;
        let handlers = self.handlers.read().await;
        handlers
            .get(&key)
            .cloned()
            .ok_or(ProtocolError::NoHandler(key))
    }
}

/// What the engine asks the step runtime to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    StartExecution,
    CancelExecution,
    StateCheck,
    SuccessCallback,
    FailureCallback,
}

/// One invocation of the step runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    /// The step being driven, with its current status
    pub step: Step,

    /// Opaque completion token of the engine's task activation
    pub token: String,

    pub request_type: RequestType,

    /// Failure details, set for failure callbacks only
    pub failure: Option<StepFailure>,
}

impl StepRequest {
    pub fn new(step: Step, token: impl Into<String>, request_type: RequestType) -> Self {
        StepRequest {
            step,
            token: token.into(),
            request_type,
            failure: None,
        }
    }
}

/// Mirror of step status into the owning job. Implemented by the job
/// executor; pipeline steps skip it entirely.
#[async_trait]
pub trait StatusSync: Send + Sync + 'static {
    async fn sync_step(&self, step: Step) -> Result<(), StoreError>;
}

/// Drives step requests through the protocol
pub struct StepRuntime {
    registry: Arc<StepRegistry>,
    engine: Arc<dyn ExecutionEngine>,
    triggers: Arc<dyn TriggerRegistrar>,
    sync: Arc<dyn StatusSync>,
    state_check_period: Duration,
}

impl StepRuntime {
    pub fn new(
        registry: Arc<StepRegistry>,
        engine: Arc<dyn ExecutionEngine>,
        triggers: Arc<dyn TriggerRegistrar>,
        sync: Arc<dyn StatusSync>,
        state_check_period: Duration,
    ) -> Self {
        StepRuntime {
            registry,
            engine,
            triggers,
            sync,
            state_check_period,
        }
    }

    pub async fn handle(&self, request: StepRequest) -> Result<(), ProtocolError> {
        if request.step.is_delegate() {
            return Err(ProtocolError::NotExecutable(request.step.global_id()));
        }
        match request.request_type {
            RequestType::StartExecution => self.start_execution(request).await,
            RequestType::CancelExecution => self.cancel_execution(request).await,
            RequestType::StateCheck => self.check_state(request).await,
            RequestType::SuccessCallback => self.finalize_success(request).await,
            RequestType::FailureCallback => {
                let failure = request
                    .failure
                    .clone()
                    .unwrap_or_else(|| StepFailure::new("Step reported failure"));
                self.report_failure(request, failure).await
            }
        }
    }

    async fn start_execution(&self, mut request: StepRequest) -> Result<(), ProtocolError> {
        let handler = self.registry.resolve(&request.step).await?;
        request.step.status.set_state(State::Running)?;
        self.sync_status(&request.step).await?;

        // A prior failed attempt leaves its diagnostics on the status
        let resumed = request.step.status.error_message.is_some();
        let result = if resumed {
            handler.resume(&request.step).await
        } else {
            handler.execute(&request.step).await
        };
        if let Err(failure) = result {
            return self.report_failure(request, failure).await;
        }

        if is_async(&request.step) {
            // The remote process was only started; poll it from now on
            let check = StepRequest {
                step: request.step.clone(),
                token: request.token.clone(),
                request_type: RequestType::StateCheck,
                failure: None,
            };
            self.triggers
                .register(
                    &request.step.global_id(),
                    serde_json::to_value(&check)?,
                    self.state_check_period,
                )
                .await?;
            Ok(())
        } else {
            self.finalize_success(request).await
        }
    }

    async fn check_state(&self, mut request: StepRequest) -> Result<(), ProtocolError> {
        let handler = self.registry.resolve(&request.step).await?;
        match handler.execution_state(&request.step).await {
            Err(UnknownState) => {
                // Indeterminate; no heartbeat, no failure. A persistent
                // condition runs into the engine's heartbeat timeout.
                log::debug!(
                    "State of step {} is currently unknown",
                    request.step.global_id()
                );
                Ok(())
            }
            Ok(AsyncExecutionState::Running) => {
                match self.engine.send_heartbeat(&request.token).await {
                    Ok(()) => {
                        request.step.status.touch();
                        self.sync_status(&request.step).await
                    }
                    Err(EngineError::InvalidToken) => {
                        // The engine no longer waits for this activation;
                        // treat it as an externally initiated cancellation
                        log::warn!(
                            "Heartbeat for step {} was rejected as stale, cancelling",
                            request.step.global_id()
                        );
                        self.cancel_execution(request).await
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Ok(AsyncExecutionState::Succeeded) => self.finalize_success(request).await,
            Ok(AsyncExecutionState::Failed(failure)) => self.report_failure(request, failure).await,
        }
    }

    async fn cancel_execution(&self, mut request: StepRequest) -> Result<(), ProtocolError> {
        let handler = self.registry.resolve(&request.step).await?;
        if request.step.status.state().may_transition_to(State::Cancelling) {
            request.step.status.set_state(State::Cancelling)?;
            self.sync_status(&request.step).await?;
        }
        if let Err(failure) = handler.cancel(&request.step).await {
            return self.report_failure(request, failure).await;
        }
        request.step.status.set_state(State::Cancelled)?;
        self.triggers.unregister(&request.step.global_id()).await?;
        self.sync_status(&request.step).await
    }

    async fn finalize_success(&self, mut request: StepRequest) -> Result<(), ProtocolError> {
        let handler = self.registry.resolve(&request.step).await?;
        if let Err(failure) = handler.on_success(&request.step).await {
            return self.report_failure(request, failure).await;
        }
        request.step.status.set_state(State::Succeeded)?;
        let payload = serde_json::to_value(&request.step.output_sets)?;
        if let Err(e) = self.engine.send_success(&request.token, payload).await {
            log::error!(
                "Could not report success of step {} to the engine: {e}",
                request.step.global_id()
            );
        }
        self.triggers.unregister(&request.step.global_id()).await?;
        self.sync_status(&request.step).await
    }

    async fn report_failure(
        &self,
        mut request: StepRequest,
        failure: StepFailure,
    ) -> Result<(), ProtocolError> {
        let handler = self.registry.resolve(&request.step).await?;
        let retryable = failure
            .retryable
            .unwrap_or_else(|| handler.classify_failure(&failure));
        request.step.status.set_failed(
            &failure.message,
            failure.cause.clone(),
            failure.code.clone(),
            retryable,
        );
        if let Err(e) = self
            .engine
            .send_failure(&request.token, &failure.message, failure.cause.as_deref())
            .await
        {
            log::error!(
                "Could not report failure of step {} to the engine: {e}",
                request.step.global_id()
            );
        }
        self.triggers.unregister(&request.step.global_id()).await?;
        self.sync_status(&request.step).await
    }

    async fn sync_status(&self, step: &Step) -> Result<(), ProtocolError> {
        if step.pipeline {
            // Pipeline steps are not status-synchronized mid-flight
            return Ok(());
        }
        self.sync.sync_step(step.clone()).await?;
        Ok(())
    }
}

fn is_async(step: &Step) -> bool {
    match &step.kind {
        StepKind::Function(function) => function.mode == ExecutionMode::Async,
        StepKind::ClusterJob(_) => true,
        StepKind::Delegate(_) => false,
    }
}
