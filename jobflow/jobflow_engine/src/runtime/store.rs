use async_trait::async_trait;
use jobflow_model::{Job, State};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error type for job persistence
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Other store error: {0}")]
    Other(String),
}

/// Selection criteria for loading jobs
#[derive(Debug, Clone)]
pub enum JobFilter {
    /// Every stored job
    All,
    /// Jobs currently in the given state
    ByState(State),
    /// Jobs contending over the given resource key, optionally narrowed
    /// by state
    ByResourceKey { key: String, state: Option<State> },
}

/// Persistence collaborator for jobs. The store is the single source of
/// truth; the executor loads, mutates, and stores whole jobs.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Store a job, overwriting any previous version
    async fn store_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Load a job by id
    async fn load_job(&self, job_id: &str) -> Result<Job, StoreError>;

    /// Delete a job by id
    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError>;

    /// Load all jobs matching the filter
    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError>;
}

/// In-memory job store
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        MemoryJobStore::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn store_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn load_job(&self, job_id: &str) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_id);
        Ok(())
    }

    async fn load_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| match &filter {
                JobFilter::All => true,
                JobFilter::ByState(state) => job.status.state() == *state,
                JobFilter::ByResourceKey { key, state } => {
                    job.resource_key() == Some(key.as_str())
                        && state.map(|s| job.status.state() == s).unwrap_or(true)
                }
            })
            .cloned()
            .collect();
        // Deterministic ordering, oldest first
        matching.sort_by_key(|job| job.created_at);
        Ok(matching)
    }
}
