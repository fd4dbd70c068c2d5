//! Graph sequencing: converting excess parallelism into staged sequential
//! execution until the graph's peak resource demand fits the free
//! capacity. Trades wall-clock time for resource fit; never changes the
//! aggregate work.

use jobflow_model::{StepExecution, StepGraph};

/// Reshape `graph` until `fits` accepts it or no parallelism remains.
/// Each round takes the first parallel node in depth-first order and
/// either flips it to sequential (two or fewer children) or splits its
/// children in half into two parallel stages under a new sequential
/// parent. Returns whether the graph fits in the end.
pub fn optimize(graph: &mut StepGraph, fits: impl Fn(&StepGraph) -> bool) -> bool {
    loop {
        if fits(graph) {
            return true;
        }
        if !split_first_parallel(graph) {
            // Fully sequential and still too big for the budget
            return false;
        }
    }
}

/// Whether any parallel node is left to sequence
pub fn has_parallelism(graph: &StepGraph) -> bool {
    graph.parallel
        || graph.executions.iter().any(|e| match e {
            StepExecution::Graph(sub) => has_parallelism(sub),
            StepExecution::Step(_) => false,
        })
}

fn split_first_parallel(graph: &mut StepGraph) -> bool {
    if graph.parallel {
        split_parallel_node(graph);
        return true;
    }
    for execution in &mut graph.executions {
        if let StepExecution::Graph(sub) = execution {
            if split_first_parallel(sub) {
                return true;
            }
        }
    }
    false
}

fn split_parallel_node(graph: &mut StepGraph) {
    if graph.executions.len() <= 2 {
        graph.parallel = false;
        return;
    }
    let tail = graph.executions.split_off(graph.executions.len() / 2);
    let head = std::mem::take(&mut graph.executions);
    graph.parallel = false;
    graph.executions = vec![
        StepExecution::Graph(StepGraph {
            executions: head,
            parallel: true,
        }),
        StepExecution::Graph(StepGraph {
            executions: tail,
            parallel: true,
        }),
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_model::job::aggregate_loads;
    use jobflow_model::{
        ExecutionMode, ExecutionResource, FunctionStep, Load, Step, StepKind,
    };
    use serde_json::json;

    fn io_step(units: f64) -> Step {
        Step::new(
            "j",
            StepKind::Function(FunctionStep {
                handler: "work".to_string(),
                mode: ExecutionMode::Sync,
                parameters: json!({}),
            }),
        )
        .with_resources(vec![Load::new(ExecutionResource::IoBound, units)])
    }

    fn fits_budget(budget: f64) -> impl Fn(&StepGraph) -> bool {
        move |graph| {
            aggregate_loads(graph)
                .get(&ExecutionResource::IoBound)
                .copied()
                .unwrap_or(0.0)
                <= budget
        }
    }

    #[test]
    fn test_graph_that_fits_is_left_alone() {
        let mut graph = StepGraph::parallel()
            .with_step(io_step(2.0))
            .with_step(io_step(2.0));
        let before = graph.clone();
        assert!(optimize(&mut graph, fits_budget(5.0)));
        assert_eq!(graph, before);
    }

    #[test]
    fn test_two_branches_are_flipped_sequential() {
        let mut graph = StepGraph::parallel()
            .with_step(io_step(3.0))
            .with_step(io_step(3.0));
        assert!(optimize(&mut graph, fits_budget(5.0)));
        assert!(!graph.parallel);
        assert_eq!(graph.size(), 2);
        assert_eq!(aggregate_loads(&graph)[&ExecutionResource::IoBound], 3.0);
    }

    #[test]
    fn test_wide_fanout_is_split_in_stages() {
        let mut graph = StepGraph::parallel()
            .with_step(io_step(2.0))
            .with_step(io_step(2.0))
            .with_step(io_step(2.0))
            .with_step(io_step(2.0));
        // Budget of 4 forces one split: two stages of two parallel steps
        assert!(optimize(&mut graph, fits_budget(4.0)));
        assert!(!graph.parallel);
        assert_eq!(graph.executions.len(), 2);
        assert_eq!(graph.size(), 4);
        assert_eq!(aggregate_loads(&graph)[&ExecutionResource::IoBound], 4.0);
    }

    #[test]
    fn test_sequencing_terminates_at_fully_sequential() {
        let mut graph = StepGraph::parallel()
            .with_step(io_step(4.0))
            .with_step(io_step(4.0))
            .with_step(io_step(4.0));
        // Budget of 1 can never be met, but the loop must still terminate
        assert!(!optimize(&mut graph, fits_budget(1.0)));
        assert!(!has_parallelism(&graph));
        // The work itself is untouched
        assert_eq!(graph.size(), 3);
        assert_eq!(aggregate_loads(&graph)[&ExecutionResource::IoBound], 4.0);
    }

    #[test]
    fn test_nested_parallel_node_is_found_depth_first() {
        let inner = StepGraph::parallel()
            .with_step(io_step(3.0))
            .with_step(io_step(3.0));
        let mut graph = StepGraph::sequential()
            .with_step(io_step(1.0))
            .with_graph(inner);
        assert!(optimize(&mut graph, fits_budget(4.0)));
        assert!(!has_parallelism(&graph));
        assert_eq!(aggregate_loads(&graph)[&ExecutionResource::IoBound], 3.0);
    }
}
