use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

/// Error type for trigger registration
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Other trigger error: {0}")]
    Other(String),
}

/// Registrar for recurring triggers. Asynchronous steps register a
/// state-check trigger here; its payload is delivered back into the step
/// runtime every period until the trigger is unregistered.
#[async_trait]
pub trait TriggerRegistrar: Send + Sync + 'static {
    /// Register (or replace) a recurring trigger under the given key
    async fn register(&self, key: &str, payload: Value, period: Duration)
        -> Result<(), TriggerError>;

    /// Remove a trigger. Removing an unknown key is not an error.
    async fn unregister(&self, key: &str) -> Result<(), TriggerError>;
}

/// In-memory registrar recording registrations without firing them.
/// Deployments wire a real scheduler here; tests inspect and replay the
/// recorded payloads.
#[derive(Default)]
pub struct MemoryTriggerRegistrar {
    triggers: RwLock<HashMap<String, (Value, Duration)>>,
}

impl MemoryTriggerRegistrar {
    pub fn new() -> Self {
        MemoryTriggerRegistrar::default()
    }

    /// The payload currently registered under a key
    pub async fn registered_payload(&self, key: &str) -> Option<Value> {
        let triggers = self.triggers.read().await;
        triggers.get(key).map(|(payload, _)| payload.clone())
    }

    pub async fn registered_count(&self) -> usize {
        self.triggers.read().await.len()
    }
}

#[async_trait]
impl TriggerRegistrar for MemoryTriggerRegistrar {
    async fn register(
        &self,
        key: &str,
        payload: Value,
        period: Duration,
    ) -> Result<(), TriggerError> {
        let mut triggers = self.triggers.write().await;
        triggers.insert(key.to_string(), (payload, period));
        Ok(())
    }

    async fn unregister(&self, key: &str) -> Result<(), TriggerError> {
        let mut triggers = self.triggers.write().await;
        triggers.remove(key);
        Ok(())
    }
}
