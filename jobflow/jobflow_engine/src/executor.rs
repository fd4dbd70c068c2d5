//! The job executor: owns the job lifecycle from submission to a final
//! state. It fuses new graphs against succeeded jobs over the same
//! resource key, admits work against free virtual units (sequencing the
//! graph when the full parallel shape does not fit), compiles admitted
//! graphs into state machines on the external engine, and converges
//! cancellations.

use crate::compiler::fusion;
use crate::compiler::sequencing;
use crate::compiler::transform::{CompileError, GraphTransformer};
use crate::config::Config;
use crate::protocol::{ProtocolError, StatusSync, StepRegistry};
use crate::runtime::engine::{EngineError, ExecutionEngine};
use crate::runtime::resources::{ResourceError, ResourceRegistry};
use crate::runtime::store::{JobFilter, JobStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use jobflow_model::{
    aggregate_loads, now_millis, Action, Job, JobError, LoadMap, State, StatusError, Step,
    StepGraph,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Error type for executor operations
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Job {0} cannot be resumed in its current state")]
    NotResumable(String),

    #[error("Job {0} is still active and cannot be deleted")]
    StillActive(String),

    #[error("Handler rejected step {step_id}: {message}")]
    HandlerRejection { step_id: String, message: String },

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Other executor error: {0}")]
    Other(String),
}

/// Pre-submission rewrite of a job. Deployments plug domain-specific
/// graph construction in here; the default accepts the job as handed in.
#[async_trait]
pub trait JobCompiler: Send + Sync + 'static {
    async fn compile(&self, job: &mut Job) -> Result<(), ExecutorError>;
}

/// Compiler that leaves the submitted job untouched
pub struct PassthroughCompiler;

#[async_trait]
impl JobCompiler for PassthroughCompiler {
    async fn compile(&self, _job: &mut Job) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Whether the required load fits into the free capacity. Resources
/// absent from the capacity map have none to give.
fn fits_within(required: &LoadMap, free: &LoadMap) -> bool {
    required
        .iter()
        .all(|(resource, units)| *units <= free.get(resource).copied().unwrap_or(0.0))
}

/// Orchestrates jobs across the store, the resource registry, and the
/// external execution engine
pub struct JobExecutor {
    config: Config,
    store: Arc<dyn JobStore>,
    engine: Arc<dyn ExecutionEngine>,
    resources: Arc<dyn ResourceRegistry>,
    registry: Arc<StepRegistry>,
    compiler: Arc<dyn JobCompiler>,
    transformer: GraphTransformer,
    is_running: RwLock<bool>,
    cancel_txs: Mutex<Vec<mpsc::Sender<()>>>,
}

impl JobExecutor {
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        engine: Arc<dyn ExecutionEngine>,
        resources: Arc<dyn ResourceRegistry>,
        registry: Arc<StepRegistry>,
        compiler: Arc<dyn JobCompiler>,
    ) -> Self {
        let transformer = GraphTransformer::new(&config);
        JobExecutor {
            config,
            store,
            engine,
            resources,
            registry,
            compiler,
            transformer,
            is_running: RwLock::new(false),
            cancel_txs: Mutex::new(Vec::new()),
        }
    }

    pub async fn job(&self, job_id: &str) -> Result<Job, ExecutorError> {
        Ok(self.store.load_job(job_id).await?)
    }

    /// Accept a job: run the pre-submission compiler, let each step's
    /// handler prepare and validate it, and persist the job as SUBMITTED.
    /// A job with steps that do not validate yet is persisted but stays
    /// NOT_READY.
    pub async fn submit(&self, mut job: Job) -> Result<Job, ExecutorError> {
        self.compiler.compile(&mut job).await?;
        let job_id = job.id.clone();
        let mut ready = true;
        for step in job.steps.steps_mut() {
            // The job owns its steps; their identity follows it
            step.job_id = job_id.clone();
            if step.is_delegate() {
                continue;
            }
            let handler = self.registry.resolve(step).await?;
            handler
                .prepare(step)
                .await
                .map_err(|f| ExecutorError::HandlerRejection {
                    step_id: step.global_id(),
                    message: f.message.clone(),
                })?;
            let valid = handler
                .validate(step)
                .await
                .map_err(|f| ExecutorError::HandlerRejection {
                    step_id: step.global_id(),
                    message: f.message.clone(),
                })?;
            if valid {
                step.status.set_state(State::Submitted)?;
            } else {
                log::warn!("Step {} is not ready for submission", step.global_id());
                ready = false;
            }
        }
        if ready {
            job.status.set_state(State::Submitted)?;
        }
        job.refresh_aggregates();
        job.touch();
        self.store.store_job(&job).await?;
        log::info!(
            "Job {} submitted with {} steps ({})",
            job.id,
            job.steps.size(),
            job.status.state()
        );
        Ok(job)
    }

    /// Queue a submitted job for execution and attempt to start it right
    /// away. When admission is denied the job stays PENDING and is picked
    /// up by the periodic sweep.
    pub async fn start(&self, job_id: &str) -> Result<Job, ExecutorError> {
        let mut job = self.store.load_job(job_id).await?;
        job.status.set_state(State::Pending)?;
        job.status.desired_action = Some(Action::Start);
        for step in job.steps.steps_mut() {
            if !step.status.state().is_final() {
                step.status.set_state(State::Pending)?;
            }
        }
        self.store.store_job(&job).await?;
        self.try_start(job).await
    }

    /// Request cancellation. Jobs that never reached the engine are
    /// cancelled immediately; active jobs enter CANCELLING and the
    /// monitor drives them to a final state.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, ExecutorError> {
        let mut job = self.store.load_job(job_id).await?;
        let state = job.status.state();
        if state.is_final() || state == State::Cancelling {
            return Ok(job);
        }
        if !state.may_transition_to(State::Cancelling) {
            // Nothing was handed to the engine yet
            for step in job.steps.steps_mut() {
                if !step.status.state().is_final() {
                    step.status.force_state(State::Cancelled);
                }
            }
            job.status.force_state(State::Cancelled);
            job.refresh_aggregates();
            job.touch();
            self.store.store_job(&job).await?;
            return Ok(job);
        }
        job.status.set_state(State::Cancelling)?;
        job.status.desired_action = Some(Action::Cancel);
        job.status.cancellation_requested_at = Some(now_millis());
        if let Some(execution_id) = &job.execution_id {
            if let Err(e) = self.engine.stop_execution(execution_id).await {
                log::warn!("Could not stop execution {execution_id} of job {}: {e}", job.id);
            }
        }
        job.touch();
        self.store.store_job(&job).await?;
        log::info!("Job {} is being cancelled", job.id);
        Ok(job)
    }

    /// Resume a failed or cancelled job by redriving its execution.
    /// Cancelled and retryably-failed steps re-enter PENDING; diagnostics
    /// stay on the status so handlers can tell a resume from a first
    /// attempt.
    pub async fn resume(&self, job_id: &str) -> Result<Job, ExecutorError> {
        let mut job = self.store.load_job(job_id).await?;
        if !job.is_resumable() {
            return Err(ExecutorError::NotResumable(job_id.to_string()));
        }
        job.status.set_state(State::Resuming)?;
        job.status.desired_action = Some(Action::Resume);
        for step in job.steps.steps_mut() {
            let status = &mut step.status;
            match status.state() {
                // Cancelled steps re-run on redrive; back to PENDING so
                // their status syncs are not dropped as stale
                State::Cancelled => status.force_state(State::Pending),
                State::Failed if status.failed_retryable => {
                    status.force_state(State::Pending)
                }
                _ => {}
            }
        }
        self.store.store_job(&job).await?;

        let Some(execution_id) = job.execution_id.clone() else {
            // The previous attempt failed before anything was created on
            // the engine; go through regular admission again
            job.status.set_state(State::Pending)?;
            self.store.store_job(&job).await?;
            return self.try_start(job).await;
        };
        self.engine.redrive_execution(&execution_id).await?;
        job.status.set_state(State::Pending)?;
        job.status.set_state(State::Running)?;
        job.touch();
        self.store.store_job(&job).await?;
        log::info!("Job {} resumed via execution {execution_id}", job.id);
        Ok(job)
    }

    /// Ingest a step-status update into its job. A newly failed step
    /// fails the job, stops the ongoing execution, and cancels the
    /// remaining steps.
    pub async fn update_step(&self, job_id: &str, step: Step) -> Result<Job, ExecutorError> {
        let mut job = self.store.load_job(job_id).await?;
        let outcome = job.apply_step_update(step)?;
        if !outcome.accepted {
            log::debug!("Dropped stale step update for job {}", job.id);
        }
        if outcome.newly_failed {
            self.converge_failure(&mut job).await;
        }
        self.store.store_job(&job).await?;
        Ok(job)
    }

    /// Delete a job and its execution. Active jobs must be cancelled
    /// first.
    pub async fn delete(&self, job_id: &str) -> Result<(), ExecutorError> {
        let job = self.store.load_job(job_id).await?;
        if matches!(
            job.status.state(),
            State::Running | State::Cancelling | State::Resuming
        ) {
            return Err(ExecutorError::StillActive(job_id.to_string()));
        }
        if let Some(execution_id) = &job.execution_id {
            if let Err(e) = self.engine.delete_execution(execution_id).await {
                log::warn!("Could not delete execution {execution_id} of job {}: {e}", job.id);
            }
        }
        self.store.delete_job(job_id).await?;
        Ok(())
    }

    /// One pass over PENDING jobs, oldest first, attempting to start each
    /// one whose status has settled past the debounce window. Spawned
    /// periodically by [`start_workers`](Self::start_workers).
    pub async fn sweep_pending(&self) -> Result<(), ExecutorError> {
        let pending = self.store.load_jobs(JobFilter::ByState(State::Pending)).await?;
        let debounce = chrono::Duration::milliseconds(
            self.config.pending_start_debounce.as_millis() as i64,
        );
        let now = Utc::now();
        for job in pending {
            if now.signed_duration_since(job.updated_at) < debounce {
                continue;
            }
            let job_id = job.id.clone();
            match self.try_start(job).await {
                Ok(job) if job.status.state() == State::Pending => {
                    log::warn!("Job {} is still waiting for free capacity", job.id);
                }
                Ok(_) => {}
                Err(e) => log::error!("Could not start pending job {job_id}: {e}"),
            }
        }
        Ok(())
    }

    /// One pass over CANCELLING jobs. Steps that never started are
    /// cancelled outright; running steps get until the cancellation
    /// timeout to converge before they are forced into a non-retryable
    /// failure. Once every step is final the job becomes CANCELLED, or
    /// FAILED if any step failed.
    pub async fn monitor_cancellations(&self) -> Result<(), ExecutorError> {
        let cancelling = self
            .store
            .load_jobs(JobFilter::ByState(State::Cancelling))
            .await?;
        let timeout_millis = self.config.cancellation_timeout.as_millis() as u64;
        for mut job in cancelling {
            let deadline_passed = job
                .status
                .cancellation_requested_at
                .map(|t| now_millis().saturating_sub(t) >= timeout_millis)
                .unwrap_or(false);

            let mut any_failed = false;
            let mut all_final = true;
            for step in job.steps.steps_mut() {
                let state = step.status.state();
                if state.is_final() {
                    any_failed |= state == State::Failed;
                } else if state == State::Running || state == State::Cancelling {
                    if deadline_passed {
                        step.status.set_failed(
                            "Step did not converge within the cancellation timeout",
                            None,
                            Some("CANCELLATION_TIMEOUT".to_string()),
                            false,
                        );
                        any_failed = true;
                    } else {
                        all_final = false;
                    }
                } else {
                    // Never reached the engine, nothing out there to stop
                    step.status.force_state(State::Cancelled);
                }
            }

            if all_final {
                job.refresh_aggregates();
                if any_failed {
                    job.status.set_state(State::Failed)?;
                } else {
                    job.status.set_state(State::Cancelled)?;
                }
                log::info!("Job {} converged to {}", job.id, job.status.state());
            }
            job.touch();
            self.store.store_job(&job).await?;
        }
        Ok(())
    }

    /// Spawn the periodic pending sweep and cancellation monitor
    pub async fn start_workers(self: Arc<Self>) {
        let mut running = self.is_running.write().await;
        if *running {
            log::warn!("Executor workers are already running");
            return;
        }
        *running = true;
        drop(running);

        Self::spawn_worker(
            Arc::clone(&self),
            self.config.pending_sweep_period,
            WorkerKind::PendingSweep,
        )
        .await;
        Self::spawn_worker(
            Arc::clone(&self),
            self.config.cancellation_monitor_period,
            WorkerKind::CancellationMonitor,
        )
        .await;
        log::info!("Executor workers started");
    }

    /// Stop the background workers
    pub async fn shutdown(&self) {
        let mut running = self.is_running.write().await;
        *running = false;
        drop(running);
        let mut txs = self.cancel_txs.lock().await;
        for tx in txs.drain(..) {
            let _ = tx.send(()).await;
        }
        log::info!("Executor workers stopped");
    }

    async fn spawn_worker(executor: Arc<Self>, period: Duration, kind: WorkerKind) {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        executor.cancel_txs.lock().await.push(tx);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let result = match kind {
                            WorkerKind::PendingSweep => executor.sweep_pending().await,
                            WorkerKind::CancellationMonitor => {
                                executor.monitor_cancellations().await
                            }
                        };
                        if let Err(e) = result {
                            log::error!("Worker pass failed: {e}");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
        });
    }

    /// Try to bring a PENDING job to execution: fuse against reusable
    /// predecessors, short-circuit when nothing is left to run, and admit
    /// against free capacity before launching on the engine.
    async fn try_start(&self, mut job: Job) -> Result<Job, ExecutorError> {
        self.apply_reuse(&mut job).await?;

        if !job.needs_execution() {
            job.refresh_aggregates();
            job.status.set_state(State::Succeeded)?;
            job.touch();
            self.store.store_job(&job).await?;
            log::info!("Job {} fully covered by reuse, no execution needed", job.id);
            return Ok(job);
        }

        if !self.admit(&mut job).await? {
            log::debug!("Job {} denied admission, staying queued", job.id);
            job.touch();
            self.store.store_job(&job).await?;
            return Ok(job);
        }

        self.launch(job).await
    }

    /// Fuse the job's graph against the succeeded job over the same
    /// resource key that covers the most steps. Candidates are offered
    /// oldest first, so on equal coverage the oldest result wins. Graphs
    /// that were already fused, and jobs being resumed, are left alone.
    async fn apply_reuse(&self, job: &mut Job) -> Result<(), ExecutorError> {
        if fusion::delegate_count(&job.steps) > 0
            || job.status.desired_action == Some(Action::Resume)
        {
            return Ok(());
        }
        let Some(key) = job.resource_key() else {
            return Ok(());
        };
        let candidates = self
            .store
            .load_jobs(JobFilter::ByResourceKey {
                key: key.to_string(),
                state: Some(State::Succeeded),
            })
            .await?;

        let mut best: Option<(usize, StepGraph)> = None;
        for candidate in &candidates {
            // No transitive reuse chains: a graph that itself delegates
            // is not an eligible source
            if candidate.id == job.id || fusion::delegate_count(&candidate.steps) > 0 {
                continue;
            }
            let fused = fusion::fuse(&job.steps, &candidate.steps);
            let count = fusion::delegate_count(&fused);
            let better = match &best {
                None => count > 0,
                Some((covered, _)) => count > *covered,
            };
            if better {
                best = Some((count, fused));
            }
        }
        if let Some((count, fused)) = best {
            log::info!("Job {} reuses {count} steps from an earlier run", job.id);
            job.steps = fused;
            job.refresh_aggregates();
        }
        Ok(())
    }

    /// Check the job's load against free capacity, sequencing the graph
    /// until it fits. Returns false when even the fully sequential shape
    /// exceeds what is free. The reshaped graph is adopted only on
    /// admission, so a denied job keeps its parallel shape for the next
    /// attempt.
    async fn admit(&self, job: &mut Job) -> Result<bool, ExecutorError> {
        let free = self.resources.free_virtual_units().await?;
        let parallelism_supported = self.config.parallelism_supported;
        let mut shaped = job.steps.clone();
        let admitted = sequencing::optimize(&mut shaped, |graph| {
            (parallelism_supported || !sequencing::has_parallelism(graph))
                && fits_within(&aggregate_loads(graph), &free)
        });
        if admitted {
            job.steps = shaped;
        }
        Ok(admitted)
    }

    /// Compile the admitted graph and hand it to the engine. The job is
    /// marked RUNNING before the execution exists, so a crash in between
    /// leaves a job that fails fast rather than one running untracked.
    async fn launch(&self, mut job: Job) -> Result<Job, ExecutorError> {
        job.status.set_state(State::Running)?;
        job.touch();
        self.store.store_job(&job).await?;

        let comment = job
            .description
            .clone()
            .unwrap_or_else(|| format!("Execution of job {}", job.id));
        let machine = self.transformer.compile(&comment, &job.steps, job.pipeline)?;

        let launched = async {
            let execution_id = self.engine.create_execution(&machine).await?;
            if !job.pipeline {
                // Pipeline executions are started by their surrounding
                // pipeline, not by the executor
                self.engine.start_execution(&execution_id).await?;
            }
            Ok::<String, EngineError>(execution_id)
        }
        .await;

        match launched {
            Ok(execution_id) => {
                log::info!("Job {} launched as execution {execution_id}", job.id);
                job.execution_id = Some(execution_id);
                if job.pipeline {
                    // Pipeline steps never sync status mid-flight, so they
                    // are marked running here
                    for step in job.steps.steps_mut() {
                        if !step.status.state().is_final() {
                            step.status.set_state(State::Running)?;
                        }
                    }
                }
                job.touch();
                self.store.store_job(&job).await?;
                Ok(job)
            }
            Err(e) => {
                job.status.runtime.set_failed(
                    format!("Could not launch execution: {e}"),
                    None,
                    Some("EXECUTION_ENGINE".to_string()),
                    false,
                );
                job.touch();
                self.store.store_job(&job).await?;
                Err(e.into())
            }
        }
    }

    /// Converge a job whose step just failed: stop the ongoing execution
    /// and cancel every step that has not reached a final state. Leaving
    /// those steps behind would pin the job in a non-resumable shape.
    async fn converge_failure(&self, job: &mut Job) {
        self.stop_silently(job).await;
        for step in job.steps.steps_mut() {
            if !step.status.state().is_final() {
                step.status.force_state(State::Cancelled);
            }
        }
        job.refresh_aggregates();
    }

    async fn stop_silently(&self, job: &Job) {
        if let Some(execution_id) = &job.execution_id {
            if let Err(e) = self.engine.stop_execution(execution_id).await {
                log::warn!("Could not stop execution {execution_id} of job {}: {e}", job.id);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum WorkerKind {
    PendingSweep,
    CancellationMonitor,
}

#[async_trait]
impl StatusSync for JobExecutor {
    async fn sync_step(&self, step: Step) -> Result<(), StoreError> {
        let mut job = self.store.load_job(&step.job_id).await?;
        let outcome = job
            .apply_step_update(step)
            .map_err(|e| StoreError::Other(e.to_string()))?;
        if outcome.newly_failed {
            self.converge_failure(&mut job).await;
        }
        self.store.store_job(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::transform::StateMachine;
    use crate::protocol::{AsyncExecutionState, StepFailure, StepHandler, UnknownState};
    use crate::runtime::resources::FixedCapacityRegistry;
    use crate::runtime::store::MemoryJobStore;
    use jobflow_model::{
        DatasetDescription, ExecutionMode, ExecutionResource, FunctionStep, Load, StepKind,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct NoopHandler {
        valid: bool,
    }

    #[async_trait]
    impl StepHandler for NoopHandler {
        async fn execute(&self, _step: &Step) -> Result<(), StepFailure> {
            Ok(())
        }

        async fn cancel(&self, _step: &Step) -> Result<(), StepFailure> {
            Ok(())
        }

        async fn validate(&self, _step: &Step) -> Result<bool, StepFailure> {
            Ok(self.valid)
        }

        async fn execution_state(&self, _step: &Step) -> Result<AsyncExecutionState, UnknownState> {
            Ok(AsyncExecutionState::Running)
        }
    }

    #[derive(Default)]
    struct CountingEngine {
        creates: AtomicUsize,
        starts: AtomicUsize,
        stops: AtomicUsize,
        redrives: AtomicUsize,
        deletes: AtomicUsize,
        fail_create: AtomicBool,
    }

    #[async_trait]
    impl ExecutionEngine for CountingEngine {
        async fn create_execution(&self, _definition: &StateMachine) -> Result<String, EngineError> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(EngineError::Other("engine unavailable".to_string()));
            }
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok("exec-1".to_string())
        }

        async fn start_execution(&self, _execution_id: &str) -> Result<(), EngineError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop_execution(&self, _execution_id: &str) -> Result<(), EngineError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn redrive_execution(&self, _execution_id: &str) -> Result<(), EngineError> {
            self.redrives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_execution(&self, _execution_id: &str) -> Result<(), EngineError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn send_heartbeat(&self, _token: &str) -> Result<(), EngineError> {
            Ok(())
        }

        async fn send_success(&self, _token: &str, _payload: Value) -> Result<(), EngineError> {
            Ok(())
        }

        async fn send_failure(
            &self,
            _token: &str,
            _error: &str,
            _cause: Option<&str>,
        ) -> Result<(), EngineError> {
            Ok(())
        }
    }

    struct Fixture {
        executor: JobExecutor,
        store: Arc<MemoryJobStore>,
        engine: Arc<CountingEngine>,
    }

    async fn fixture(capacity_units: f64) -> Fixture {
        fixture_with(capacity_units, Config::default(), true).await
    }

    async fn fixture_with(capacity_units: f64, mut config: Config, valid: bool) -> Fixture {
        // The debounce would make tests wait; drop it
        config.pending_start_debounce = Duration::ZERO;
        let store = Arc::new(MemoryJobStore::new());
        let engine = Arc::new(CountingEngine::default());
        let mut capacity = LoadMap::new();
        capacity.insert(db(), capacity_units);
        let resources = Arc::new(FixedCapacityRegistry::new(capacity, store.clone()));
        let registry = Arc::new(StepRegistry::new());
        registry
            .register("work", Arc::new(NoopHandler { valid }))
            .await;
        let executor = JobExecutor::new(
            config,
            store.clone(),
            engine.clone(),
            resources,
            registry,
            Arc::new(PassthroughCompiler),
        );
        Fixture {
            executor,
            store,
            engine,
        }
    }

    fn db() -> ExecutionResource {
        ExecutionResource::Db {
            instance_id: "db-1".to_string(),
        }
    }

    fn work_step(job_id: &str, units: f64) -> Step {
        Step::new(
            job_id,
            StepKind::Function(FunctionStep {
                handler: "work".to_string(),
                mode: ExecutionMode::Sync,
                parameters: json!({}),
            }),
        )
        .with_resources(vec![Load {
            resource: db(),
            estimated_virtual_units: units,
        }])
    }

    fn job_with_steps(graph: StepGraph) -> Job {
        Job::new()
            .with_target(DatasetDescription::new("dataset-a"))
            .with_steps(graph)
    }

    #[tokio::test]
    async fn test_submit_validates_and_persists() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let submitted = f.executor.submit(job).await.unwrap();

        assert_eq!(submitted.status.state(), State::Submitted);
        let stored = f.store.load_job(&submitted.id).await.unwrap();
        assert_eq!(stored.status.state(), State::Submitted);
        assert_eq!(stored.steps.steps()[0].status.state(), State::Submitted);
    }

    #[tokio::test]
    async fn test_submit_keeps_an_invalid_job_not_ready() {
        let f = fixture_with(10.0, Config::default(), false).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();

        assert_eq!(job.status.state(), State::NotReady);
        // Persisted anyway, and not startable until it validates
        assert!(f.store.load_job(&job.id).await.is_ok());
        assert!(f.executor.start(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_start_launches_when_capacity_allows() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 2.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        assert_eq!(job.status.state(), State::Running);
        assert!(job.execution_id.is_some());
        assert_eq!(f.engine.creates.load(Ordering::SeqCst), 1);
        assert_eq!(f.engine.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_queues_when_capacity_is_exhausted() {
        let f = fixture(1.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 2.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        assert_eq!(job.status.state(), State::Pending);
        assert_eq!(f.engine.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sequencing_admits_an_oversized_parallel_graph() {
        // Two parallel branches of 3 units against 4 free: sequenced,
        // the peak is max(3, 3) = 3 and the job is admitted
        let f = fixture(4.0).await;
        let graph = StepGraph::parallel()
            .with_step(work_step("j", 3.0))
            .with_step(work_step("j", 3.0));
        let job = job_with_steps(graph);
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        assert_eq!(job.status.state(), State::Running);
        assert!(!sequencing::has_parallelism(&job.steps));
        assert_eq!(f.engine.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_fails_the_job() {
        let f = fixture(10.0).await;
        f.engine.fail_create.store(true, Ordering::SeqCst);
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let result = f.executor.start(&job.id).await;

        assert!(result.is_err());
        let stored = f.store.load_job(&job.id).await.unwrap();
        assert_eq!(stored.status.state(), State::Failed);
        assert_eq!(stored.status.runtime.error_code.as_deref(), Some("EXECUTION_ENGINE"));
        assert!(!stored.status.runtime.failed_retryable);
    }

    #[tokio::test]
    async fn test_cancel_of_a_running_job_enters_cancelling() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();
        let job = f.executor.cancel(&job.id).await.unwrap();

        assert_eq!(job.status.state(), State::Cancelling);
        assert!(job.status.cancellation_requested_at.is_some());
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_of_a_submitted_job_is_immediate() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.cancel(&job.id).await.unwrap();

        // SUBMITTED may enter CANCELLING, so the monitor converges it
        assert_eq!(job.status.state(), State::Cancelling);
        f.executor.monitor_cancellations().await.unwrap();
        let stored = f.store.load_job(&job.id).await.unwrap();
        assert_eq!(stored.status.state(), State::Cancelled);
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_times_out_into_failure() {
        let mut config = Config::default();
        config.cancellation_timeout = Duration::ZERO;
        let f = fixture_with(10.0, config, true).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let mut job = f.executor.start(&job.id).await.unwrap();

        // Simulate the step having been picked up by the engine
        for step in job.steps.steps_mut() {
            step.status.set_state(State::Running).unwrap();
        }
        f.store.store_job(&job).await.unwrap();

        f.executor.cancel(&job.id).await.unwrap();
        f.executor.monitor_cancellations().await.unwrap();

        let stored = f.store.load_job(&job.id).await.unwrap();
        assert_eq!(stored.status.state(), State::Failed);
        let step = &stored.steps.steps()[0];
        assert_eq!(step.status.state(), State::Failed);
        assert!(!step.status.failed_retryable);
        assert_eq!(step.status.error_code.as_deref(), Some("CANCELLATION_TIMEOUT"));
    }

    #[tokio::test]
    async fn test_partially_converged_cancellation_ends_in_failure() {
        let mut config = Config::default();
        config.cancellation_timeout = Duration::ZERO;
        let f = fixture_with(10.0, config, true).await;
        let graph = StepGraph::parallel()
            .with_step(work_step("j", 1.0))
            .with_step(work_step("j", 1.0))
            .with_step(work_step("j", 1.0));
        let job = f.executor.submit(job_with_steps(graph)).await.unwrap();
        let mut job = f.executor.start(&job.id).await.unwrap();

        // Two steps already wound down, one is stuck running
        let mut steps = job.steps.steps_mut();
        steps[0].status.force_state(State::Cancelled);
        steps[1].status.force_state(State::Cancelled);
        steps[2].status.set_state(State::Running).unwrap();
        f.store.store_job(&job).await.unwrap();

        f.executor.cancel(&job.id).await.unwrap();
        f.executor.monitor_cancellations().await.unwrap();

        // The stuck step is forced down and taints the whole job
        let stored = f.store.load_job(&job.id).await.unwrap();
        assert_eq!(stored.status.state(), State::Failed);
        assert_eq!(stored.steps.steps()[2].status.state(), State::Failed);
        assert_eq!(
            stored.steps.steps()[0].status.state(),
            State::Cancelled
        );
    }

    #[tokio::test]
    async fn test_step_failure_stops_the_execution_and_fails_the_job() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let mut failed = job.steps.steps()[0].clone();
        failed
            .status
            .set_failed("out of disk", None, Some("E-DISK".to_string()), true);
        let job = f.executor.update_step(&job.id, failed).await.unwrap();

        assert_eq!(job.status.state(), State::Failed);
        assert_eq!(job.status.runtime.error_code.as_deref(), Some("E-DISK"));
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_denied_admission_keeps_the_parallel_shape() {
        let f = fixture(1.0).await;
        let graph = StepGraph::parallel()
            .with_step(work_step("j", 2.0))
            .with_step(work_step("j", 2.0));
        let job = f.executor.submit(job_with_steps(graph)).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();
        assert_eq!(job.status.state(), State::Pending);

        // The next attempt may have more capacity and must still see the
        // parallel graph
        let stored = f.store.load_job(&job.id).await.unwrap();
        assert!(sequencing::has_parallelism(&stored.steps));
    }

    #[tokio::test]
    async fn test_failed_step_cancels_its_siblings() {
        let f = fixture(10.0).await;
        let graph = StepGraph::sequential()
            .with_step(work_step("j", 1.0))
            .with_step(work_step("j", 1.0));
        let job = f.executor.submit(job_with_steps(graph)).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let mut failed = job.steps.steps()[0].clone();
        failed.status.set_failed("transient", None, None, true);
        let job = f.executor.update_step(&job.id, failed).await.unwrap();

        assert_eq!(job.status.state(), State::Failed);
        assert_eq!(job.steps.steps()[1].status.state(), State::Cancelled);
        assert!(job.is_resumable());
        assert_eq!(f.engine.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_resets_cancelled_steps_to_pending() {
        let f = fixture(10.0).await;
        let graph = StepGraph::sequential()
            .with_step(work_step("j", 1.0))
            .with_step(work_step("j", 1.0));
        let job = f.executor.submit(job_with_steps(graph)).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let mut failed = job.steps.steps()[0].clone();
        failed.status.set_failed("transient", None, None, true);
        f.executor.update_step(&job.id, failed).await.unwrap();

        let job = f.executor.resume(&job.id).await.unwrap();
        assert_eq!(job.status.state(), State::Running);
        assert_eq!(f.engine.redrives.load(Ordering::SeqCst), 1);
        for step in job.steps.steps() {
            assert_eq!(step.status.state(), State::Pending);
        }
    }

    #[tokio::test]
    async fn test_resume_redrives_a_retryably_failed_job() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let mut failed = job.steps.steps()[0].clone();
        failed
            .status
            .set_failed("transient", None, None, true);
        let job = f.executor.update_step(&job.id, failed).await.unwrap();
        assert_eq!(job.status.state(), State::Failed);

        let job = f.executor.resume(&job.id).await.unwrap();
        assert_eq!(job.status.state(), State::Running);
        assert_eq!(f.engine.redrives.load(Ordering::SeqCst), 1);
        assert_eq!(job.steps.steps()[0].status.state(), State::Pending);
    }

    #[tokio::test]
    async fn test_resume_rejects_a_non_retryable_failure() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let mut failed = job.steps.steps()[0].clone();
        failed
            .status
            .set_failed("corrupt input", None, None, false);
        let job = f.executor.update_step(&job.id, failed).await.unwrap();

        let err = f.executor.resume(&job.id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NotResumable(_)));
    }

    #[tokio::test]
    async fn test_delete_refuses_active_jobs() {
        let f = fixture(10.0).await;
        let job = job_with_steps(StepGraph::sequential().with_step(work_step("j", 1.0)));
        let job = f.executor.submit(job).await.unwrap();
        let job = f.executor.start(&job.id).await.unwrap();

        let err = f.executor.delete(&job.id).await.unwrap_err();
        assert!(matches!(err, ExecutorError::StillActive(_)));

        f.executor.cancel(&job.id).await.unwrap();
        f.executor.monitor_cancellations().await.unwrap();
        f.executor.delete(&job.id).await.unwrap();
        assert!(f.store.load_job(&job.id).await.is_err());
        assert_eq!(f.engine.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let f = fixture(1.0).await;
        let executor = Arc::new(f.executor);
        executor.clone().start_workers().await;
        assert!(*executor.is_running.read().await);
        executor.shutdown().await;
        assert!(!*executor.is_running.read().await);
    }

    #[tokio::test]
    async fn test_sweep_starts_a_queued_job_once_capacity_frees_up() {
        let f = fixture(2.0).await;
        // Occupies the whole capacity
        let blocker = job_with_steps(StepGraph::sequential().with_step(work_step("a", 2.0)));
        let blocker = f.executor.submit(blocker).await.unwrap();
        let blocker = f.executor.start(&blocker.id).await.unwrap();
        assert_eq!(blocker.status.state(), State::Running);

        let queued = Job::new()
            .with_target(DatasetDescription::new("dataset-b"))
            .with_steps(StepGraph::sequential().with_step(work_step("b", 2.0)));
        let queued = f.executor.submit(queued).await.unwrap();
        let queued = f.executor.start(&queued.id).await.unwrap();
        assert_eq!(queued.status.state(), State::Pending);

        // Blocker finishes, freeing its units
        let mut done = blocker.steps.steps()[0].clone();
        done.status.set_state(State::Running).unwrap();
        done.status.set_state(State::Succeeded).unwrap();
        f.executor.update_step(&blocker.id, done).await.unwrap();

        f.executor.sweep_pending().await.unwrap();
        let started = f.store.load_job(&queued.id).await.unwrap();
        assert_eq!(started.status.state(), State::Running);
    }
}
