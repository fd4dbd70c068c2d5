use crate::load::Load;
use crate::status::{RuntimeInfo, State};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Prefix of an embedded input-set reference inside step parameters
pub const INPUT_SET_REF_PREFIX: &str = "${inputSet:";

/// Whether a parameter value is an unresolved input-set reference token
/// of the form `${inputSet:<producer>.<name>}`
pub fn is_input_set_ref(value: &str) -> bool {
    value.starts_with(INPUT_SET_REF_PREFIX) && value.ends_with('}')
}

/// Split an input-set reference token into its producer id and set name.
/// The producer may itself contain dots (a global step id), so the name is
/// everything after the last dot.
pub fn parse_input_set_ref(value: &str) -> Option<(&str, &str)> {
    if !is_input_set_ref(value) {
        return None;
    }
    let inner = &value[INPUT_SET_REF_PREFIX.len()..value.len() - 1];
    let dot = inner.rfind('.')?;
    Some((&inner[..dot], &inner[dot + 1..]))
}

/// Render an input-set reference token
pub fn format_input_set_ref(producer: &str, name: &str) -> String {
    format!("{INPUT_SET_REF_PREFIX}{producer}.{name}}}")
}

/// The step that produced a data set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    /// Job the producing step belongs to
    pub job_id: String,

    /// Id of the producing step within that job
    pub step_id: String,
}

impl Provider {
    pub fn new(job_id: impl Into<String>, step_id: impl Into<String>) -> Self {
        Provider {
            job_id: job_id.into(),
            step_id: step_id.into(),
        }
    }

    /// Composite `<jobId>.<stepId>` identity
    pub fn global_id(&self) -> String {
        format!("{}.{}", self.job_id, self.step_id)
    }
}

/// A named reference to upstream data a step consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSet {
    /// The producing step, or None for user-supplied input
    pub provider: Option<Provider>,

    /// Name of the data set
    pub name: String,

    /// Whether the content follows the shared data model
    pub model_based: bool,
}

impl InputSet {
    pub fn user_provided(name: impl Into<String>) -> Self {
        InputSet {
            provider: None,
            name: name.into(),
            model_based: false,
        }
    }

    pub fn from_step(provider: Provider, name: impl Into<String>) -> Self {
        InputSet {
            provider: Some(provider),
            name: name.into(),
            model_based: false,
        }
    }
}

/// A named data set a step produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSet {
    /// Name of the data set
    pub name: String,

    /// Whether the content follows the shared data model
    pub model_based: bool,
}

impl OutputSet {
    pub fn new(name: impl Into<String>) -> Self {
        OutputSet {
            name: name.into(),
            model_based: false,
        }
    }
}

/// How a function step's invocation completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    /// The invocation returns only when the work is done
    #[default]
    Sync,
    /// The invocation only starts a remote process; completion is
    /// reported later through state checks and callbacks
    Async,
}

/// A serverless-compute step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionStep {
    /// Name of the registered handler implementing the business logic
    pub handler: String,

    /// Invocation completion mode
    pub mode: ExecutionMode,

    /// Handler-specific parameters, embedded into the invocation payload
    pub parameters: Value,
}

/// A big-data cluster job step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterJob {
    /// Target cluster application
    pub application_id: String,

    /// Execution role the cluster assumes
    pub execution_role: String,

    /// Location of the job artifact
    pub jar_url: String,

    /// Positional script parameters, may contain input-set references
    pub script_params: Vec<String>,

    /// Runtime tuning parameters passed through verbatim
    pub runtime_params: String,
}

/// Reference to an already-succeeded step of an older job whose outputs
/// this step stands in for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateRef {
    /// Job owning the delegate step
    pub delegate_job_id: String,

    /// Id of the delegate step within its job
    pub delegate_step_id: String,

    /// The delegate's produced output sets
    pub output_sets: Vec<OutputSet>,
}

impl DelegateRef {
    /// Composite identity of the delegate
    pub fn global_id(&self) -> String {
        format!("{}.{}", self.delegate_job_id, self.delegate_step_id)
    }
}

/// The closed set of step implementations. New kinds are added here and
/// registered in the engine's dispatch table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StepKind {
    Function(FunctionStep),
    ClusterJob(ClusterJob),
    Delegate(DelegateRef),
}

impl StepKind {
    /// Stable kind name used for dispatch and state naming
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Function(_) => "Function",
            StepKind::ClusterJob(_) => "ClusterJob",
            StepKind::Delegate(_) => "Delegate",
        }
    }
}

/// A single unit of work inside a job's step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Job this step belongs to
    pub job_id: String,

    /// Identifier unique within the job
    pub id: String,

    /// Runtime status
    pub status: RuntimeInfo,

    /// The concrete implementation of this step
    pub kind: StepKind,

    /// Upstream data this step consumes
    pub input_sets: Vec<InputSet>,

    /// Data this step produces
    pub output_sets: Vec<OutputSet>,

    /// Load this step puts on execution resources while running
    pub needed_resources: Vec<Load>,

    /// Ids of steps that must complete before this one
    pub previous_step_ids: BTreeSet<String>,

    /// Execution timeout in seconds
    pub timeout_seconds: u64,

    /// Expected execution duration, used for progress weighting
    pub estimated_execution_seconds: u64,

    /// Steps flagged not reusable never take part in fusion
    pub not_reusable: bool,

    /// Whether this step belongs to a pipeline-mode job; such steps do not
    /// synchronize their status mid-flight
    pub pipeline: bool,
}

impl Step {
    /// Create a step with a generated id
    pub fn new(job_id: impl Into<String>, kind: StepKind) -> Self {
        let id = format!("s-{}", &Uuid::new_v4().simple().to_string()[..6]);
        Step {
            job_id: job_id.into(),
            id,
            status: RuntimeInfo::default(),
            kind,
            input_sets: Vec::new(),
            output_sets: Vec::new(),
            needed_resources: Vec::new(),
            previous_step_ids: BTreeSet::new(),
            timeout_seconds: 3600,
            estimated_execution_seconds: 60,
            not_reusable: false,
            pipeline: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_input_sets(mut self, input_sets: Vec<InputSet>) -> Self {
        self.input_sets = input_sets;
        self
    }

    pub fn with_output_sets(mut self, output_sets: Vec<OutputSet>) -> Self {
        self.output_sets = output_sets;
        self
    }

    pub fn with_resources(mut self, needed_resources: Vec<Load>) -> Self {
        self.needed_resources = needed_resources;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_estimated_execution_seconds(mut self, seconds: u64) -> Self {
        self.estimated_execution_seconds = seconds;
        self
    }

    pub fn not_reusable(mut self) -> Self {
        self.not_reusable = true;
        self
    }

    /// Composite `<jobId>.<stepId>` identity
    pub fn global_id(&self) -> String {
        format!("{}.{}", self.job_id, self.id)
    }

    pub fn is_delegate(&self) -> bool {
        matches!(self.kind, StepKind::Delegate(_))
    }

    /// Build the delegation pseudo-step that stands in for this step by
    /// pointing at `delegate`'s outputs. The result keeps this step's
    /// identity so it slots transparently into the new graph, always
    /// reports SUCCEEDED, and carries no resource load. Delegating to a
    /// step that is itself a delegation is unwrapped to the ultimate
    /// non-delegate ancestor.
    pub fn delegate_to(&self, delegate: &Step) -> Step {
        let reference = match &delegate.kind {
            StepKind::Delegate(inner) => inner.clone(),
            _ => DelegateRef {
                delegate_job_id: delegate.job_id.clone(),
                delegate_step_id: delegate.id.clone(),
                output_sets: delegate.output_sets.clone(),
            },
        };
        let mut status = RuntimeInfo::default();
        status.force_state(State::Succeeded);
        Step {
            job_id: self.job_id.clone(),
            id: self.id.clone(),
            status,
            output_sets: reference.output_sets.clone(),
            kind: StepKind::Delegate(reference),
            input_sets: self.input_sets.clone(),
            needed_resources: Vec::new(),
            previous_step_ids: self.previous_step_ids.clone(),
            timeout_seconds: self.timeout_seconds,
            estimated_execution_seconds: 0,
            not_reusable: false,
            pipeline: self.pipeline,
        }
    }

    /// Static equivalence check used by graph fusion. Decidable without
    /// executing anything: a type-and-parameter compare per kind, where
    /// two unresolved input-set reference tokens in the same position
    /// compare as equal regardless of their exact producer.
    pub fn is_equivalent_to(&self, other: &Step) -> bool {
        if self.not_reusable || other.not_reusable {
            return false;
        }
        match (&self.kind, &other.kind) {
            (StepKind::Function(a), StepKind::Function(b)) => {
                a.handler == b.handler
                    && a.mode == b.mode
                    && json_equivalent(&a.parameters, &b.parameters)
            }
            (StepKind::ClusterJob(a), StepKind::ClusterJob(b)) => {
                a.application_id == b.application_id
                    && a.execution_role == b.execution_role
                    && a.jar_url == b.jar_url
                    && a.script_params.len() == b.script_params.len()
                    && a
                        .script_params
                        .iter()
                        .zip(&b.script_params)
                        .all(|(x, y)| string_equivalent(x, y))
            }
            _ => false,
        }
    }
}

fn string_equivalent(a: &str, b: &str) -> bool {
    a == b || (is_input_set_ref(a) && is_input_set_ref(b))
}

fn json_equivalent(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => string_equivalent(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(v, w)| json_equivalent(v, w))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| json_equivalent(v, w)))
        }
        _ => a == b,
    }
}
