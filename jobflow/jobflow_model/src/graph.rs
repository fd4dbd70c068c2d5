use crate::step::Step;
use serde::{Deserialize, Serialize};

/// One element of a step graph: either a leaf step or a nested sub-graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepExecution {
    Step(Step),
    Graph(StepGraph),
}

impl StepExecution {
    /// Structural equivalence used by graph fusion: steps compare by their
    /// kind-specific equivalence, graphs recurse, mixed nodes never match
    pub fn is_equivalent_to(&self, other: &StepExecution) -> bool {
        match (self, other) {
            (StepExecution::Step(a), StepExecution::Step(b)) => a.is_equivalent_to(b),
            (StepExecution::Graph(a), StepExecution::Graph(b)) => a.is_equivalent_to(b),
            _ => false,
        }
    }

    /// Number of leaf steps below this node
    pub fn size(&self) -> usize {
        match self {
            StepExecution::Step(_) => 1,
            StepExecution::Graph(g) => g.size(),
        }
    }
}

/// Recursive composite of steps and sub-graphs. Executions run one after
/// another unless the graph is flagged parallel. Graphs nest arbitrarily
/// but form a tree; sub-graphs are never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepGraph {
    /// Ordered child executions
    pub executions: Vec<StepExecution>,

    /// Whether the children run concurrently
    pub parallel: bool,
}

impl StepGraph {
    pub fn sequential() -> Self {
        StepGraph {
            executions: Vec::new(),
            parallel: false,
        }
    }

    pub fn parallel() -> Self {
        StepGraph {
            executions: Vec::new(),
            parallel: true,
        }
    }

    pub fn with_execution(mut self, execution: StepExecution) -> Self {
        self.executions.push(execution);
        self
    }

    pub fn with_step(self, step: Step) -> Self {
        self.with_execution(StepExecution::Step(step))
    }

    pub fn with_graph(self, graph: StepGraph) -> Self {
        self.with_execution(StepExecution::Graph(graph))
    }

    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }

    /// Number of leaf steps in the whole tree
    pub fn size(&self) -> usize {
        self.executions.iter().map(|e| e.size()).sum()
    }

    /// All leaf steps in depth-first order
    pub fn steps(&self) -> Vec<&Step> {
        let mut out = Vec::new();
        self.collect_steps(&mut out);
        out
    }

    fn collect_steps<'a>(&'a self, out: &mut Vec<&'a Step>) {
        for execution in &self.executions {
            match execution {
                StepExecution::Step(step) => out.push(step),
                StepExecution::Graph(graph) => graph.collect_steps(out),
            }
        }
    }

    /// All leaf steps in depth-first order, mutably
    pub fn steps_mut(&mut self) -> Vec<&mut Step> {
        let mut out = Vec::new();
        self.collect_steps_mut(&mut out);
        out
    }

    fn collect_steps_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Step>) {
        for execution in &mut self.executions {
            match execution {
                StepExecution::Step(step) => out.push(step),
                StepExecution::Graph(graph) => graph.collect_steps_mut(out),
            }
        }
    }

    /// Find a leaf step by its id
    pub fn get_step(&self, step_id: &str) -> Option<&Step> {
        self.steps().into_iter().find(|s| s.id == step_id)
    }

    /// Replace the leaf step carrying the same id in place. Returns false
    /// when no such step exists.
    pub fn replace_step(&mut self, step: Step) -> bool {
        for existing in self.steps_mut() {
            if existing.id == step.id {
                *existing = step;
                return true;
            }
        }
        false
    }

    /// Structural equivalence: same composition flag, same arity, and
    /// index-aligned equivalent children
    pub fn is_equivalent_to(&self, other: &StepGraph) -> bool {
        self.parallel == other.parallel
            && self.executions.len() == other.executions.len()
            && self
                .executions
                .iter()
                .zip(&other.executions)
                .all(|(a, b)| a.is_equivalent_to(b))
    }
}
