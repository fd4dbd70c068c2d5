//! Graph fusion: replacing subtrees of a new job's step graph with
//! delegating pseudo-steps that point at equivalent, already-succeeded
//! steps of an older job's graph.

use jobflow_model::step::{format_input_set_ref, parse_input_set_ref};
use jobflow_model::{DelegateRef, Provider, Step, StepExecution, StepGraph, StepKind};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Canonicalize a graph bottom-up: drop steps flagged not reusable, drop
/// empty sub-graphs, collapse singleton sub-graphs into their one child,
/// and unwrap a singleton root. Applied to the old graph before fusion so
/// the comparison runs against reusable structure only.
pub fn canonicalize(graph: &StepGraph) -> StepGraph {
    unwrap_root(canonicalize_inner(graph, true))
}

/// Structural canonicalization of the new graph: empties and singletons
/// are collapsed the same way, but not-reusable steps are kept. They are
/// part of the work to execute; equivalence already refuses to delegate
/// them.
fn normalize(graph: &StepGraph) -> StepGraph {
    unwrap_root(canonicalize_inner(graph, false))
}

fn canonicalize_inner(graph: &StepGraph, drop_not_reusable: bool) -> StepGraph {
    let mut executions = Vec::new();
    for execution in &graph.executions {
        match execution {
            StepExecution::Step(step) => {
                if !(drop_not_reusable && step.not_reusable) {
                    executions.push(StepExecution::Step(step.clone()));
                }
            }
            StepExecution::Graph(sub) => {
                let mut canonical = canonicalize_inner(sub, drop_not_reusable);
                if canonical.is_empty() {
                    continue;
                }
                if canonical.executions.len() == 1 {
                    executions.push(canonical.executions.remove(0));
                } else {
                    executions.push(StepExecution::Graph(canonical));
                }
            }
        }
    }
    StepGraph {
        executions,
        parallel: graph.parallel,
    }
}

fn unwrap_root(mut graph: StepGraph) -> StepGraph {
    while graph.executions.len() == 1 {
        match graph.executions.remove(0) {
            StepExecution::Graph(inner) => graph = inner,
            other => {
                graph.executions.push(other);
                break;
            }
        }
    }
    graph
}

/// Number of delegation pseudo-steps in a graph. Used to score fusion
/// candidates against each other.
pub fn delegate_count(graph: &StepGraph) -> usize {
    graph.steps().iter().filter(|s| s.is_delegate()).count()
}

fn execution_delegate_count(execution: &StepExecution) -> usize {
    match execution {
        StepExecution::Step(step) => step.is_delegate() as usize,
        StepExecution::Graph(graph) => delegate_count(graph),
    }
}

/// Fuse a new graph with the completed graph of an older job. The result
/// is structurally equivalent to the new graph, with as many leaf steps
/// as possible replaced by delegations into the old graph, previous-step
/// relations re-woven, and reused inputs re-pointed at the old outputs.
pub fn fuse(new_graph: &StepGraph, old_graph: &StepGraph) -> StepGraph {
    let new_graph = normalize(new_graph);
    let old_graph = canonicalize(old_graph);
    let mut fused = replace_by_delegations(&new_graph, &old_graph);
    rewire_previous_steps(&mut fused);
    resolve_reused_inputs(&mut fused);
    fused
}

fn replace_by_delegations(new: &StepGraph, old: &StepGraph) -> StepGraph {
    if new.parallel != old.parallel {
        // Normalize by wrapping the sequential side into a singleton
        // parallel graph, then unwrap the result again
        return if !new.parallel {
            let wrapped = StepGraph {
                executions: vec![StepExecution::Graph(new.clone())],
                parallel: true,
            };
            let mut result = replace_parallel(&wrapped, old);
            match result.executions.pop() {
                Some(StepExecution::Graph(inner)) => inner,
                Some(step) => StepGraph {
                    executions: vec![step],
                    parallel: false,
                },
                None => StepGraph::sequential(),
            }
        } else {
            let wrapped = StepGraph {
                executions: vec![StepExecution::Graph(old.clone())],
                parallel: true,
            };
            replace_parallel(new, &wrapped)
        };
    }
    if new.parallel {
        replace_parallel(new, old)
    } else {
        replace_sequential(new, old)
    }
}

/// Sequential graphs reuse a prefix only: once a pair of executions is
/// not equivalent, everything after it in the sequence may be affected by
/// the change and is kept verbatim.
fn replace_sequential(new: &StepGraph, old: &StepGraph) -> StepGraph {
    let mut result = StepGraph::sequential();
    let common = new.executions.len().min(old.executions.len());
    for i in 0..common {
        let new_execution = &new.executions[i];
        let old_execution = &old.executions[i];
        if new_execution.is_equivalent_to(old_execution) {
            result
                .executions
                .push(delegate_execution(new_execution, old_execution));
        } else {
            break;
        }
    }
    let replaced = result.executions.len();
    result
        .executions
        .extend(new.executions[replaced..].iter().cloned());
    result
}

/// Parallel branches are independent, so each new branch is evaluated
/// against every old branch and the candidate producing the most
/// delegations wins. Greedy per branch, not a global optimum.
fn replace_parallel(new: &StepGraph, old: &StepGraph) -> StepGraph {
    let mut result = StepGraph::parallel();
    for new_branch in &new.executions {
        let mut best: Option<StepExecution> = None;
        let mut best_count = 0;
        for old_branch in &old.executions {
            let candidate = replace_branch(new_branch, old_branch);
            let count = execution_delegate_count(&candidate);
            if count > best_count {
                best_count = count;
                best = Some(candidate);
            }
        }
        result
            .executions
            .push(best.unwrap_or_else(|| new_branch.clone()));
    }
    result
}

fn replace_branch(new_branch: &StepExecution, old_branch: &StepExecution) -> StepExecution {
    match (new_branch, old_branch) {
        (StepExecution::Graph(new_sub), StepExecution::Graph(old_sub)) => {
            StepExecution::Graph(replace_by_delegations(new_sub, old_sub))
        }
        (StepExecution::Step(new_step), StepExecution::Step(old_step))
            if new_step.is_equivalent_to(old_step) =>
        {
            StepExecution::Step(new_step.delegate_to(old_step))
        }
        _ => new_branch.clone(),
    }
}

/// Turn a pair of executions already known to be equivalent into a fully
/// delegated copy of the new one
fn delegate_execution(new_execution: &StepExecution, old_execution: &StepExecution) -> StepExecution {
    match (new_execution, old_execution) {
        (StepExecution::Step(new_step), StepExecution::Step(old_step)) => {
            StepExecution::Step(new_step.delegate_to(old_step))
        }
        (StepExecution::Graph(new_sub), StepExecution::Graph(old_sub)) => {
            StepExecution::Graph(StepGraph {
                executions: new_sub
                    .executions
                    .iter()
                    .zip(&old_sub.executions)
                    .map(|(n, o)| delegate_execution(n, o))
                    .collect(),
                parallel: new_sub.parallel,
            })
        }
        _ => new_execution.clone(),
    }
}

/// Recompute the previous-step relations of every leaf from the graph
/// structure: a step depends on the terminal steps of whatever ran before
/// it in the enclosing sequence.
pub fn rewire_previous_steps(graph: &mut StepGraph) {
    rewire_graph(graph, &BTreeSet::new());
}

fn rewire_graph(graph: &mut StepGraph, incoming: &BTreeSet<String>) -> BTreeSet<String> {
    if graph.parallel {
        let mut terminals = BTreeSet::new();
        for execution in &mut graph.executions {
            terminals.extend(rewire_execution(execution, incoming));
        }
        terminals
    } else {
        let mut previous = incoming.clone();
        for execution in &mut graph.executions {
            previous = rewire_execution(execution, &previous);
        }
        previous
    }
}

fn rewire_execution(execution: &mut StepExecution, incoming: &BTreeSet<String>) -> BTreeSet<String> {
    match execution {
        StepExecution::Step(step) => {
            step.previous_step_ids = incoming.clone();
            BTreeSet::from([step.id.clone()])
        }
        StepExecution::Graph(sub) => rewire_graph(sub, incoming),
    }
}

/// Re-point the input sets of steps consuming outputs that are now
/// provided by a delegation, and rewrite embedded input-set reference
/// tokens inside step parameters the same way. References that cannot be
/// dereferenced are left untouched.
fn resolve_reused_inputs(graph: &mut StepGraph) {
    let delegates: HashMap<String, DelegateRef> = graph
        .steps()
        .iter()
        .filter_map(|s| match &s.kind {
            StepKind::Delegate(reference) => Some((s.id.clone(), reference.clone())),
            _ => None,
        })
        .collect();
    if delegates.is_empty() {
        return;
    }

    for step in graph.steps_mut() {
        for input in &mut step.input_sets {
            if let Some(provider) = &input.provider {
                if let Some(reference) = delegates.get(&provider.step_id) {
                    input.provider = Some(Provider::new(
                        reference.delegate_job_id.clone(),
                        reference.delegate_step_id.clone(),
                    ));
                }
            }
        }
        rewrite_step_params(step, &delegates);
    }
}

fn rewrite_step_params(step: &mut Step, delegates: &HashMap<String, DelegateRef>) {
    match &mut step.kind {
        StepKind::Function(function) => rewrite_value(&mut function.parameters, delegates),
        StepKind::ClusterJob(cluster) => {
            for param in &mut cluster.script_params {
                if let Some(updated) = rewrite_token(param, delegates) {
                    *param = updated;
                }
            }
        }
        StepKind::Delegate(_) => {}
    }
}

fn rewrite_value(value: &mut Value, delegates: &HashMap<String, DelegateRef>) {
    match value {
        Value::String(s) => {
            if let Some(updated) = rewrite_token(s, delegates) {
                *s = updated;
            }
        }
        Value::Array(items) => {
            for item in items {
                rewrite_value(item, delegates);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                rewrite_value(item, delegates);
            }
        }
        _ => {}
    }
}

fn rewrite_token(value: &str, delegates: &HashMap<String, DelegateRef>) -> Option<String> {
    let (producer, name) = parse_input_set_ref(value)?;
    // The producer may be a plain step id or a global one; match on the
    // step-id part
    let step_id = producer.rsplit('.').next().unwrap_or(producer);
    let reference = delegates.get(step_id)?;
    Some(format_input_set_ref(&reference.global_id(), name))
}
