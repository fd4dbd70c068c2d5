use super::store::{JobStore, JobFilter, StoreError};
use async_trait::async_trait;
use jobflow_model::{LoadMap, State};
use std::sync::Arc;
use thiserror::Error;

/// Error type for free-capacity lookups
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Other resource error: {0}")]
    Other(String),
}

/// Provider of the currently free virtual units per execution resource,
/// consumed by admission control
#[async_trait]
pub trait ResourceRegistry: Send + Sync + 'static {
    async fn free_virtual_units(&self) -> Result<LoadMap, ResourceError>;
}

/// Registry backed by a fixed overall capacity minus the aggregate loads
/// of all currently running jobs
pub struct FixedCapacityRegistry {
    /// Overall capacity per resource
    capacity: LoadMap,

    /// Source of the running jobs whose loads are reserved
    store: Arc<dyn JobStore>,
}

impl FixedCapacityRegistry {
    pub fn new(capacity: LoadMap, store: Arc<dyn JobStore>) -> Self {
        FixedCapacityRegistry { capacity, store }
    }
}

#[async_trait]
impl ResourceRegistry for FixedCapacityRegistry {
    async fn free_virtual_units(&self) -> Result<LoadMap, ResourceError> {
        let mut free = self.capacity.clone();
        let running = self.store.load_jobs(JobFilter::ByState(State::Running)).await?;
        for job in running {
            for (resource, units) in job.calculate_resource_loads() {
                if let Some(remaining) = free.get_mut(&resource) {
                    *remaining = (*remaining - units).max(0.0);
                }
            }
        }
        Ok(free)
    }
}
