//! Graph transformation: compiling a delegate-pruned step graph into a
//! state-machine definition the external execution engine runs verbatim.

use crate::config::Config;
use jobflow_model::{ExecutionMode, Step, StepExecution, StepGraph, StepKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Error type for graph compilation
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("The graph contains nothing to execute")]
    NothingToExecute,

    #[error("Step {step_id} is a delegation and must not be executed")]
    NotExecutable { step_id: String },

    #[error("Step {step_id} is asynchronous and cannot be part of a pipeline job")]
    AsyncStepInPipeline { step_id: String },

    #[error("Could not serialize step payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a task state's invocation completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Invocation {
    /// The invocation itself finishes the work
    FireAndForget,
    /// The invocation only starts the work; the engine waits for a
    /// completion token and fails the state when heartbeats stop
    WaitForCompletion { heartbeat_seconds: u64 },
}

/// A single task state executing one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    /// State name, `<kind>.<step id>`
    pub name: String,

    /// The serialized step, handed to the invocation as payload
    pub payload: Value,

    /// Invocation completion mode
    pub invocation: Invocation,

    /// State timeout in seconds, never below the configured floor
    pub timeout_seconds: u64,

    /// Name of the following state, None for terminal states
    pub next: Option<String>,

    /// Whether this state ends its chain
    pub end: bool,
}

/// A state fanning out into concurrently executed branches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelState {
    /// State name
    pub name: String,

    /// The concurrent branches
    pub branches: Vec<Branch>,

    /// Name of the following state, None for terminal states
    pub next: Option<String>,

    /// Whether this state ends its chain
    pub end: bool,
}

/// One branch of a parallel state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// Name of the branch's first state
    pub start_at: String,

    /// The branch's state chain
    pub states: Vec<MachineState>,
}

/// A state of the compiled machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MachineState {
    Task(TaskState),
    Parallel(ParallelState),
}

impl MachineState {
    pub fn name(&self) -> &str {
        match self {
            MachineState::Task(s) => &s.name,
            MachineState::Parallel(s) => &s.name,
        }
    }

    fn set_next(&mut self, next: Option<String>) {
        match self {
            MachineState::Task(s) => s.next = next,
            MachineState::Parallel(s) => s.next = next,
        }
    }

    fn set_end(&mut self, end: bool) {
        match self {
            MachineState::Task(s) => s.end = end,
            MachineState::Parallel(s) => s.end = end,
        }
    }
}

/// The compiled state-machine definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMachine {
    /// Human-readable description of the machine
    pub comment: String,

    /// Name of the first state
    pub start_at: String,

    /// Overall machine timeout in seconds
    pub timeout_seconds: u64,

    /// All top-level states in execution order
    pub states: Vec<MachineState>,
}

/// Compiles step graphs into state-machine definitions
pub struct GraphTransformer {
    min_step_timeout_seconds: u64,
    heartbeat_seconds: u64,
    machine_timeout_seconds: u64,
}

impl GraphTransformer {
    pub fn new(config: &Config) -> Self {
        GraphTransformer {
            min_step_timeout_seconds: config.min_step_timeout.as_secs(),
            heartbeat_seconds: config.async_heartbeat_timeout.as_secs(),
            machine_timeout_seconds: config.state_machine_timeout.as_secs(),
        }
    }

    /// Compile a graph into an executable definition. Delegations are
    /// pruned first; they represent work that already happened and never
    /// appear in the output.
    pub fn compile(
        &self,
        comment: &str,
        graph: &StepGraph,
        pipeline: bool,
    ) -> Result<StateMachine, CompileError> {
        let pruned = prune_delegates(graph);
        let mut states = if pruned.parallel {
            vec![self.compile_parallel(&pruned, pipeline)?]
        } else {
            self.compile_sequence(&pruned, pipeline)?
        };
        if states.is_empty() {
            return Err(CompileError::NothingToExecute);
        }
        wire_chain(&mut states);
        Ok(StateMachine {
            comment: comment.to_string(),
            start_at: states[0].name().to_string(),
            timeout_seconds: self.machine_timeout_seconds,
            states,
        })
    }

    /// Compile a sequential graph into an unwired state chain. Nested
    /// sequential sub-graphs are inlined; nested parallel sub-graphs
    /// become one state within the chain.
    fn compile_sequence(
        &self,
        graph: &StepGraph,
        pipeline: bool,
    ) -> Result<Vec<MachineState>, CompileError> {
        let mut states = Vec::new();
        for execution in &graph.executions {
            match execution {
                StepExecution::Step(step) => states.push(self.compile_step(step, pipeline)?),
                StepExecution::Graph(sub) if !sub.parallel => {
                    states.extend(self.compile_sequence(sub, pipeline)?)
                }
                StepExecution::Graph(sub) => states.push(self.compile_parallel(sub, pipeline)?),
            }
        }
        Ok(states)
    }

    fn compile_parallel(
        &self,
        graph: &StepGraph,
        pipeline: bool,
    ) -> Result<MachineState, CompileError> {
        let mut branches = Vec::new();
        for execution in &graph.executions {
            let mut states = match execution {
                StepExecution::Step(step) => vec![self.compile_step(step, pipeline)?],
                StepExecution::Graph(sub) if !sub.parallel => {
                    self.compile_sequence(sub, pipeline)?
                }
                StepExecution::Graph(sub) => vec![self.compile_parallel(sub, pipeline)?],
            };
            if states.is_empty() {
                return Err(CompileError::NothingToExecute);
            }
            wire_chain(&mut states);
            branches.push(Branch {
                start_at: states[0].name().to_string(),
                states,
            });
        }
        if branches.is_empty() {
            return Err(CompileError::NothingToExecute);
        }
        Ok(MachineState::Parallel(ParallelState {
            name: format!("Parallel.{}", &Uuid::new_v4().simple().to_string()[..6]),
            branches,
            next: None,
            end: false,
        }))
    }

    fn compile_step(&self, step: &Step, pipeline: bool) -> Result<MachineState, CompileError> {
        let invocation = match &step.kind {
            StepKind::Delegate(_) => {
                return Err(CompileError::NotExecutable {
                    step_id: step.global_id(),
                })
            }
            StepKind::Function(function) => match function.mode {
                ExecutionMode::Sync => Invocation::FireAndForget,
                ExecutionMode::Async => {
                    if pipeline {
                        return Err(CompileError::AsyncStepInPipeline {
                            step_id: step.global_id(),
                        });
                    }
                    Invocation::WaitForCompletion {
                        heartbeat_seconds: self.heartbeat_seconds,
                    }
                }
            },
            // Cluster jobs always run remotely and report back through
            // the completion token
            StepKind::ClusterJob(_) => Invocation::WaitForCompletion {
                heartbeat_seconds: self.heartbeat_seconds,
            },
        };
        Ok(MachineState::Task(TaskState {
            name: format!("{}.{}", step.kind.name(), step.id),
            payload: serde_json::to_value(step)?,
            invocation,
            timeout_seconds: step.timeout_seconds.max(self.min_step_timeout_seconds),
            next: None,
            end: false,
        }))
    }
}

/// Remove delegations and the empty sub-graphs they leave behind
fn prune_delegates(graph: &StepGraph) -> StepGraph {
    let mut executions = Vec::new();
    for execution in &graph.executions {
        match execution {
            StepExecution::Step(step) => {
                if !step.is_delegate() {
                    executions.push(StepExecution::Step(step.clone()));
                }
            }
            StepExecution::Graph(sub) => {
                let pruned = prune_delegates(sub);
                if !pruned.is_empty() {
                    executions.push(StepExecution::Graph(pruned));
                }
            }
        }
    }
    StepGraph {
        executions,
        parallel: graph.parallel,
    }
}

/// Point every state at its successor and mark the last one terminal
fn wire_chain(states: &mut [MachineState]) {
    let names: Vec<String> = states.iter().map(|s| s.name().to_string()).collect();
    let last = states.len() - 1;
    for (i, state) in states.iter_mut().enumerate() {
        if i < last {
            state.set_next(Some(names[i + 1].clone()));
            state.set_end(false);
        } else {
            state.set_next(None);
            state.set_end(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_model::{ClusterJob, FunctionStep};
    use serde_json::json;

    fn transformer() -> GraphTransformer {
        GraphTransformer::new(&Config::default())
    }

    fn sync_step(handler: &str) -> Step {
        Step::new(
            "j",
            StepKind::Function(FunctionStep {
                handler: handler.to_string(),
                mode: ExecutionMode::Sync,
                parameters: json!({}),
            }),
        )
    }

    fn async_step(handler: &str) -> Step {
        Step::new(
            "j",
            StepKind::Function(FunctionStep {
                handler: handler.to_string(),
                mode: ExecutionMode::Async,
                parameters: json!({}),
            }),
        )
    }

    fn task_names(states: &[MachineState]) -> Vec<&str> {
        states.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_sequential_chain_is_wired_in_order() {
        let a = sync_step("a");
        let b = sync_step("b");
        let graph = StepGraph::sequential().with_step(a.clone()).with_step(b.clone());

        let machine = transformer().compile("two steps", &graph, false).unwrap();
        assert_eq!(machine.start_at, format!("Function.{}", a.id));
        assert_eq!(machine.states.len(), 2);
        match &machine.states[0] {
            MachineState::Task(t) => {
                assert_eq!(t.next.as_deref(), Some(&*format!("Function.{}", b.id)));
                assert!(!t.end);
            }
            other => panic!("expected task, got {other:?}"),
        }
        match &machine.states[1] {
            MachineState::Task(t) => {
                assert_eq!(t.next, None);
                assert!(t.end);
            }
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_sequential_graphs_are_flattened() {
        let graph = StepGraph::sequential()
            .with_step(sync_step("a"))
            .with_graph(
                StepGraph::sequential()
                    .with_step(sync_step("b"))
                    .with_step(sync_step("c")),
            )
            .with_step(sync_step("d"));

        let machine = transformer().compile("flat", &graph, false).unwrap();
        assert_eq!(machine.states.len(), 4);
        assert!(machine
            .states
            .iter()
            .all(|s| matches!(s, MachineState::Task(_))));
    }

    #[test]
    fn test_parallel_graph_becomes_one_state_with_branches() {
        let graph = StepGraph::sequential()
            .with_step(sync_step("before"))
            .with_graph(
                StepGraph::parallel()
                    .with_step(sync_step("left"))
                    .with_graph(
                        StepGraph::sequential()
                            .with_step(sync_step("right-1"))
                            .with_step(sync_step("right-2")),
                    ),
            );

        let machine = transformer().compile("fanout", &graph, false).unwrap();
        assert_eq!(machine.states.len(), 2);
        match &machine.states[1] {
            MachineState::Parallel(p) => {
                assert_eq!(p.branches.len(), 2);
                assert_eq!(p.branches[0].states.len(), 1);
                assert_eq!(p.branches[1].states.len(), 2);
                assert_eq!(
                    p.branches[1].start_at,
                    p.branches[1].states[0].name()
                );
                assert!(p.end);
            }
            other => panic!("expected parallel state, got {other:?}"),
        }
    }

    #[test]
    fn test_every_leaf_appears_exactly_once_and_delegates_never() {
        let delegate_target = sync_step("old-import");
        let delegated = sync_step("import").delegate_to(&delegate_target);
        let graph = StepGraph::sequential()
            .with_step(delegated)
            .with_step(sync_step("index"))
            .with_graph(
                StepGraph::parallel()
                    .with_step(sync_step("tag"))
                    .with_step(sync_step("stats")),
            );

        let machine = transformer().compile("pruned", &graph, false).unwrap();
        let mut leaf_count = 0;
        fn count(states: &[MachineState], n: &mut usize) {
            for s in states {
                match s {
                    MachineState::Task(_) => *n += 1,
                    MachineState::Parallel(p) => {
                        for b in &p.branches {
                            count(&b.states, n);
                        }
                    }
                }
            }
        }
        count(&machine.states, &mut leaf_count);
        assert_eq!(leaf_count, 3);
        assert!(!task_names(&machine.states)
            .iter()
            .any(|n| n.starts_with("Delegate.")));
    }

    #[test]
    fn test_timeout_floor_is_enforced() {
        let short = sync_step("quick").with_timeout(5);
        let graph = StepGraph::sequential().with_step(short);
        let machine = transformer().compile("floor", &graph, false).unwrap();
        match &machine.states[0] {
            MachineState::Task(t) => assert_eq!(t.timeout_seconds, 300),
            other => panic!("expected task, got {other:?}"),
        }
    }

    #[test]
    fn test_async_steps_wait_for_completion() {
        let graph = StepGraph::sequential()
            .with_step(async_step("crawl"))
            .with_step(Step::new(
                "j",
                StepKind::ClusterJob(ClusterJob {
                    application_id: "app".to_string(),
                    execution_role: "role".to_string(),
                    jar_url: "s3://jars/x.jar".to_string(),
                    script_params: vec![],
                    runtime_params: String::new(),
                }),
            ));

        let machine = transformer().compile("async", &graph, false).unwrap();
        for state in &machine.states {
            match state {
                MachineState::Task(t) => assert_eq!(
                    t.invocation,
                    Invocation::WaitForCompletion {
                        heartbeat_seconds: 180
                    }
                ),
                other => panic!("expected task, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_graph_is_a_compile_error() {
        let err = transformer()
            .compile("empty", &StepGraph::sequential(), false)
            .unwrap_err();
        assert!(matches!(err, CompileError::NothingToExecute));

        // A fully delegated graph prunes down to nothing as well
        let target = sync_step("import");
        let graph =
            StepGraph::sequential().with_step(sync_step("import").delegate_to(&target));
        let err = transformer().compile("delegated", &graph, false).unwrap_err();
        assert!(matches!(err, CompileError::NothingToExecute));
    }

    #[test]
    fn test_async_step_in_pipeline_is_rejected() {
        let graph = StepGraph::sequential().with_step(async_step("crawl"));
        let err = transformer().compile("pipeline", &graph, true).unwrap_err();
        assert!(matches!(err, CompileError::AsyncStepInPipeline { .. }));
    }
}
