use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Error type for runtime status updates
#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Illegal state transition: {from} -> {to}")]
    IllegalStateTransition { from: State, to: State },
}

/// Current epoch time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Runtime state of a job or step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Placeholder for deserialized payloads that carry no state yet;
    /// transitions from it are unrestricted
    #[default]
    None,
    /// Created, but validation has not passed yet
    NotReady,
    /// Accepted and waiting to be started
    Submitted,
    /// Queued for execution, waiting for free resources
    Pending,
    /// Re-entering the queue after a failure or cancellation
    Resuming,
    /// Actively executing
    Running,
    /// Cancellation requested, teardown in progress
    Cancelling,
    /// Terminated by request; may be resumed
    Cancelled,
    /// Terminated with an error; may be resumed if retryable
    Failed,
    /// Completed successfully
    Succeeded,
}

impl State {
    /// Whether this state is terminal
    pub fn is_final(&self) -> bool {
        matches!(self, State::Cancelled | State::Failed | State::Succeeded)
    }

    /// Whether a transition from this state to `target` is allowed.
    /// Self-transitions are always allowed.
    pub fn may_transition_to(&self, target: State) -> bool {
        if *self == target {
            return true;
        }
        match self {
            State::None => true,
            State::NotReady => matches!(target, State::Submitted | State::Failed),
            State::Submitted => {
                matches!(target, State::Pending | State::Cancelling | State::Failed)
            }
            State::Pending => matches!(
                target,
                State::Running | State::Cancelling | State::Succeeded | State::Failed
            ),
            State::Resuming => {
                matches!(target, State::Pending | State::Cancelling | State::Failed)
            }
            State::Running => {
                matches!(target, State::Succeeded | State::Cancelling | State::Failed)
            }
            State::Cancelling => matches!(target, State::Cancelled | State::Failed),
            State::Cancelled => matches!(target, State::Resuming),
            State::Failed => matches!(target, State::Resuming),
            State::Succeeded => false,
        }
    }

    /// Validate a transition, returning an error when it is not allowed
    pub fn check_transition(&self, target: State) -> Result<(), StatusError> {
        if self.may_transition_to(target) {
            Ok(())
        } else {
            Err(StatusError::IllegalStateTransition {
                from: *self,
                to: target,
            })
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::None => write!(f, "NONE"),
            State::NotReady => write!(f, "NOT_READY"),
            State::Submitted => write!(f, "SUBMITTED"),
            State::Pending => write!(f, "PENDING"),
            State::Resuming => write!(f, "RESUMING"),
            State::Running => write!(f, "RUNNING"),
            State::Cancelling => write!(f, "CANCELLING"),
            State::Cancelled => write!(f, "CANCELLED"),
            State::Failed => write!(f, "FAILED"),
            State::Succeeded => write!(f, "SUCCEEDED"),
        }
    }
}

/// An action a caller has requested on a job, recorded on the status so
/// asynchronous processing can pick it up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Start,
    Cancel,
    Resume,
}

/// Runtime information tracked for a single step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeInfo {
    /// Current state
    state: State,

    /// When execution entered RUNNING (epoch millis)
    pub started_at: Option<u64>,

    /// Last time this status was touched (epoch millis)
    pub updated_at: u64,

    /// Execution progress in the range 0.0 ..= 1.0
    pub estimated_progress: f32,

    /// End time estimated before execution started (epoch millis)
    pub initial_end_time_estimation: Option<u64>,

    /// Human-readable error description, set when the state is FAILED
    pub error_message: Option<String>,

    /// Underlying cause of the failure
    pub error_cause: Option<String>,

    /// Machine-readable error code
    pub error_code: Option<String>,

    /// Whether a failure may be retried by resuming
    pub failed_retryable: bool,
}

impl Default for RuntimeInfo {
    fn default() -> Self {
        RuntimeInfo {
            state: State::NotReady,
            started_at: None,
            updated_at: now_millis(),
            estimated_progress: 0.0,
            initial_end_time_estimation: None,
            error_message: None,
            error_cause: None,
            error_code: None,
            failed_retryable: false,
        }
    }
}

impl RuntimeInfo {
    pub fn new(state: State) -> Self {
        RuntimeInfo {
            state,
            ..Default::default()
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Transition to a new state, enforcing the transition table.
    /// Entering RUNNING stamps the start time; SUCCEEDED forces full progress.
    pub fn set_state(&mut self, target: State) -> Result<(), StatusError> {
        self.state.check_transition(target)?;
        if target == State::Running && self.state != State::Running {
            self.started_at = Some(now_millis());
        }
        if target == State::Succeeded {
            self.estimated_progress = 1.0;
        }
        self.state = target;
        self.touch();
        Ok(())
    }

    /// Overwrite the state without transition checks. Reserved for
    /// deserialized payloads and forced convergence paths.
    pub fn force_state(&mut self, target: State) {
        self.state = target;
        if target == State::Succeeded {
            self.estimated_progress = 1.0;
        }
        self.touch();
    }

    /// Record a failure with its diagnostics in one go
    pub fn set_failed(
        &mut self,
        message: impl Into<String>,
        cause: Option<String>,
        code: Option<String>,
        retryable: bool,
    ) {
        self.error_message = Some(message.into());
        self.error_cause = cause;
        self.error_code = code;
        self.failed_retryable = retryable;
        self.force_state(State::Failed);
    }

    pub fn set_progress(&mut self, progress: f32) {
        self.estimated_progress = progress.clamp(0.0, 1.0);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }

    /// Extrapolate the end time from the elapsed running time and the
    /// current progress. Falls back to the initial estimation while no
    /// progress has been reported.
    pub fn estimated_end_time(&self) -> Option<u64> {
        let started = self.started_at?;
        if self.estimated_progress > 0.0 {
            let elapsed = now_millis().saturating_sub(started) as f64;
            Some(started + (elapsed / self.estimated_progress as f64) as u64)
        } else {
            self.initial_end_time_estimation
        }
    }
}

/// Runtime status of a whole job. Carries the same runtime information as
/// a step plus job-level aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeStatus {
    /// Step-style runtime information for the job itself
    #[serde(flatten)]
    pub runtime: RuntimeInfo,

    /// Total number of leaf steps in the job's graph
    pub overall_step_count: usize,

    /// Number of steps that reached SUCCEEDED
    pub succeeded_steps: usize,

    /// When execution is expected to start (epoch millis)
    pub estimated_start_time: Option<u64>,

    /// Action a caller has requested but that has not been applied yet
    pub desired_action: Option<Action>,

    /// When cancellation was requested (epoch millis); bounds how long
    /// the job may stay in CANCELLING before being force-failed
    pub cancellation_requested_at: Option<u64>,
}

impl RuntimeStatus {
    pub fn new(state: State) -> Self {
        RuntimeStatus {
            runtime: RuntimeInfo::new(state),
            ..Default::default()
        }
    }

    pub fn state(&self) -> State {
        self.runtime.state()
    }

    pub fn set_state(&mut self, target: State) -> Result<(), StatusError> {
        self.runtime.set_state(target)
    }

    pub fn force_state(&mut self, target: State) {
        self.runtime.force_state(target)
    }
}
