use crate::graph::{StepExecution, StepGraph};
use crate::load::{add_loads, LoadMap};
use crate::status::{RuntimeStatus, State};
use crate::step::Step;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for job mutations
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job {job_id} has no step {step_id}")]
    UnknownStep { job_id: String, step_id: String },
}

/// The dataset a job reads from or writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescription {
    /// Stable key identifying the dataset; jobs sharing a key contend
    /// over the same data and are reuse candidates for each other
    pub key: String,
}

impl DatasetDescription {
    pub fn new(key: impl Into<String>) -> Self {
        DatasetDescription { key: key.into() }
    }
}

/// Outcome of ingesting a step-status update into a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepUpdateOutcome {
    /// Whether the update was applied. False when it would move the step
    /// out of a final state.
    pub accepted: bool,

    /// Whether the update newly moved a step into FAILED
    pub newly_failed: bool,

    /// Whether every step of the job has now succeeded
    pub all_succeeded: bool,
}

/// A long-running, multi-step data-processing job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier
    pub id: String,

    /// Runtime status, the single source of truth for the lifecycle
    pub status: RuntimeStatus,

    /// Who submitted the job
    pub owner: Option<String>,

    /// Free-text description
    pub description: Option<String>,

    /// Dataset the job reads from
    pub source: Option<DatasetDescription>,

    /// Dataset the job writes to
    pub target: Option<DatasetDescription>,

    /// The job's execution graph
    pub steps: StepGraph,

    /// Handle into the external execution engine, set once started
    pub execution_id: Option<String>,

    /// Pipeline-mode jobs have a streaming source; their machine is
    /// created without being started and their steps skip mid-flight
    /// status synchronization
    pub pipeline: bool,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last modification time
    pub updated_at: DateTime<Utc>,

    /// Retention horizon after which the job may be cleaned up
    pub keep_until: DateTime<Utc>,
}

impl Job {
    pub fn new() -> Self {
        let now = Utc::now();
        Job {
            id: format!("j-{}", &Uuid::new_v4().simple().to_string()[..8]),
            status: RuntimeStatus::new(State::NotReady),
            owner: None,
            description: None,
            source: None,
            target: None,
            steps: StepGraph::sequential(),
            execution_id: None,
            pipeline: false,
            created_at: now,
            updated_at: now,
            keep_until: now + Duration::weeks(2),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_source(mut self, source: DatasetDescription) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: DatasetDescription) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_steps(mut self, steps: StepGraph) -> Self {
        self.steps = steps;
        self
    }

    pub fn pipeline(mut self) -> Self {
        self.pipeline = true;
        self
    }

    /// Key of the dataset this job contends over, used for reuse lookup
    /// and resource accounting
    pub fn resource_key(&self) -> Option<&str> {
        self.target.as_ref().map(|d| d.key.as_str())
    }

    pub fn secondary_resource_key(&self) -> Option<&str> {
        self.source.as_ref().map(|d| d.key.as_str())
    }

    /// Aggregate the resource loads of the whole step graph: parallel
    /// siblings sum, sequential siblings take the per-resource maximum
    pub fn calculate_resource_loads(&self) -> LoadMap {
        aggregate_loads(&self.steps)
    }

    /// Whether any step still has work left. When every step already
    /// succeeded the external engine need not be contacted at all.
    pub fn needs_execution(&self) -> bool {
        self.steps
            .steps()
            .iter()
            .any(|s| s.status.state() != State::Succeeded)
    }

    /// A job can be resumed when its state allows entering RESUMING and
    /// every step either finished, was cancelled, or failed retryably
    pub fn is_resumable(&self) -> bool {
        self.status.state().may_transition_to(State::Resuming)
            && self.status.state() != State::Resuming
            && self.steps.steps().iter().all(|s| match s.status.state() {
                State::Succeeded | State::Cancelled => true,
                State::Failed => s.status.failed_retryable,
                _ => false,
            })
    }

    /// Ingest a step-status update. Final step states are sticky: an
    /// update moving a step from a final state back to a non-final one is
    /// rejected. Accepted updates refresh the job-level aggregates and
    /// propagate a new failure into the job status.
    pub fn apply_step_update(&mut self, step: Step) -> Result<StepUpdateOutcome, JobError> {
        let existing = self
            .steps
            .get_step(&step.id)
            .ok_or_else(|| JobError::UnknownStep {
                job_id: self.id.clone(),
                step_id: step.id.clone(),
            })?;

        let previous_state = existing.status.state();
        let new_state = step.status.state();
        if previous_state.is_final() && !new_state.is_final() {
            return Ok(StepUpdateOutcome {
                accepted: false,
                newly_failed: false,
                all_succeeded: false,
            });
        }

        self.steps.replace_step(step);
        self.refresh_aggregates();

        let newly_failed = new_state == State::Failed && previous_state != State::Failed;
        if newly_failed {
            let failed = self.steps.get_step_by_state(State::Failed);
            if let Some(failed) = failed {
                self.status.runtime.error_message = failed.status.error_message.clone();
                self.status.runtime.error_cause = failed.status.error_cause.clone();
                self.status.runtime.error_code = failed.status.error_code.clone();
                self.status.runtime.failed_retryable = failed.status.failed_retryable;
            }
            if self.status.state().may_transition_to(State::Failed) {
                self.status.force_state(State::Failed);
            }
        }

        let all_succeeded = !self.needs_execution();
        if all_succeeded && self.status.state().may_transition_to(State::Succeeded) {
            self.status.force_state(State::Succeeded);
        }

        self.touch();
        Ok(StepUpdateOutcome {
            accepted: true,
            newly_failed,
            all_succeeded,
        })
    }

    /// Recompute succeeded-step count and the time-weighted progress
    /// estimate across all steps
    pub fn refresh_aggregates(&mut self) {
        let steps = self.steps.steps();
        self.status.overall_step_count = steps.len();
        self.status.succeeded_steps = steps
            .iter()
            .filter(|s| s.status.state() == State::Succeeded)
            .count();

        let total_weight: u64 = steps.iter().map(|s| s.estimated_execution_seconds).sum();
        let progress = if total_weight == 0 {
            if steps.is_empty() {
                0.0
            } else {
                self.status.succeeded_steps as f32 / steps.len() as f32
            }
        } else {
            steps
                .iter()
                .map(|s| {
                    s.estimated_execution_seconds as f32 * s.status.estimated_progress
                })
                .sum::<f32>()
                / total_weight as f32
        };
        self.status.runtime.set_progress(progress);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.status.runtime.touch();
    }
}

impl Default for Job {
    fn default() -> Self {
        Job::new()
    }
}

impl StepGraph {
    /// First leaf step currently in the given state
    pub fn get_step_by_state(&self, state: State) -> Option<&Step> {
        self.steps()
            .into_iter()
            .find(|s| s.status.state() == state)
    }
}

/// Aggregate the resource loads of a step graph under the parallel-sum,
/// sequential-max rule
pub fn aggregate_loads(graph: &StepGraph) -> LoadMap {
    let mut aggregate = LoadMap::new();
    for execution in &graph.executions {
        let child = match execution {
            StepExecution::Step(step) => {
                let mut loads = LoadMap::new();
                for load in &step.needed_resources {
                    *loads.entry(load.resource.clone()).or_insert(0.0) +=
                        load.estimated_virtual_units;
                }
                loads
            }
            StepExecution::Graph(sub) => aggregate_loads(sub),
        };
        add_loads(&mut aggregate, &child, graph.parallel);
    }
    aggregate
}
