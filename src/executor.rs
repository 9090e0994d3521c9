use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tracing::{debug, info, instrument};

use crate::error::HarvestError;
use crate::model::{HarvestParams, HarvestResult};
use crate::traits::Connector;

/// Runs harvests with a global concurrency cap and at most one in-flight
/// harvest per source. A second trigger for a busy source waits for the
/// first to finish.
pub struct HarvestExecutor {
    semaphore: Arc<Semaphore>,
    source_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HarvestExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, source_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.source_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(source_id.to_string()).or_default())
    }

    /// Whether a harvest of `source_id` currently holds its lock.
    pub fn is_running(&self, source_id: &str) -> bool {
        self.lock_for(source_id).try_lock().is_err()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    #[instrument(skip(self, connector, params), fields(source_id = %connector.source().id))]
    pub async fn execute(
        &self,
        connector: &dyn Connector,
        params: &HarvestParams,
    ) -> Result<HarvestResult, HarvestError> {
        let source_id = connector.source().id.as_str();

        let source_lock = self.lock_for(source_id);
        if source_lock.try_lock().is_err() {
            debug!(source_id, "Harvest already running, waiting");
        }
        let _in_flight = source_lock.lock().await;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| HarvestError::Executor(format!("Semaphore error: {}", e)))?;

        info!(source_id, "Starting harvest");
        let result = connector.harvest(params).await;
        info!(source_id, success = result.is_ok(), "Finished harvest");
        result
    }
}
