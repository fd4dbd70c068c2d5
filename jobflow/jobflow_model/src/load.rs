use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A contended execution resource steps can put load on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExecutionResource {
    /// Writer endpoint of a database instance
    Db { instance_id: String },
    /// Read-replica endpoint of a database instance
    DbReader { instance_id: String },
    /// Shared IO bandwidth of the deployment
    IoBound,
}

impl std::fmt::Display for ExecutionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionResource::Db { instance_id } => write!(f, "db:{instance_id}"),
            ExecutionResource::DbReader { instance_id } => write!(f, "db-reader:{instance_id}"),
            ExecutionResource::IoBound => write!(f, "io"),
        }
    }
}

/// An amount of load a step puts on one resource, in abstract virtual units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Load {
    /// The resource being loaded
    pub resource: ExecutionResource,

    /// Estimated load in virtual units
    pub estimated_virtual_units: f64,
}

impl Load {
    pub fn new(resource: ExecutionResource, estimated_virtual_units: f64) -> Self {
        Load {
            resource,
            estimated_virtual_units,
        }
    }
}

/// Aggregated load per resource
pub type LoadMap = HashMap<ExecutionResource, f64>;

/// Fold one load into an aggregate. Parallel siblings load a resource at
/// the same time, so their units add up; sequential siblings run one after
/// another, so only the largest single demand matters.
pub fn add_load(aggregate: &mut LoadMap, load: &Load, parallel: bool) {
    let entry = aggregate.entry(load.resource.clone()).or_insert(0.0);
    if parallel {
        *entry += load.estimated_virtual_units;
    } else {
        *entry = entry.max(load.estimated_virtual_units);
    }
}

/// Fold a whole load map into an aggregate under the same rule
pub fn add_loads(aggregate: &mut LoadMap, loads: &LoadMap, parallel: bool) {
    for (resource, units) in loads {
        add_load(
            aggregate,
            &Load::new(resource.clone(), *units),
            parallel,
        );
    }
}
