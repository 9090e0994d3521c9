//! Shared harvest tail.
//!
//! [`HarvestPipeline`] runs the sequential stages every connector shares
//! (Fetch → Transform → Persist) with:
//! - a timeout on each async stage
//! - structured logging via `tracing`
//! - per-stage timings reported in [`HarvestStats`]

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::error::{HarvestError, PipelineError};
use crate::model::{HarvestResult, HarvestStats, Record};
use crate::traits::SourceStore;
use crate::transform::DataTransformer;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

pub struct HarvestPipeline {
    source_id: String,

    transformer: DataTransformer,

    store: SourceStore,

    /// Timeout for the fetch and persist stages (default: 5 minutes)
    stage_timeout: Duration,
}

impl HarvestPipeline {
    pub fn new(
        source_id: impl Into<String>,
        transformer: DataTransformer,
        store: SourceStore,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            transformer,
            store,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn store(&self) -> &SourceStore {
        &self.store
    }

    /// Runs `fetch`, transforms its records and saves them.
    ///
    /// Zero fetched records is a success with `data_count == 0`. Duplicate
    /// keys in the batch are counted in `stats.write_failures` and do not
    /// fail the harvest.
    ///
    /// # Errors
    ///
    /// The fetch error itself, [`PipelineError::StageTimeout`], or
    /// [`PipelineError::PersistFailed`] when the backend rejects the batch.
    pub async fn execute<F>(&self, fetch: F) -> Result<HarvestResult, HarvestError>
    where
        F: Future<Output = Result<Vec<Record>, HarvestError>> + Send,
    {
        let start = Instant::now();
        let mut stats = HarvestStats::default();
        let source_id = self.source_id.as_str();

        // ====================================================================
        // Stage 1: Fetch
        // ====================================================================

        let fetch_start = Instant::now();
        let records = match timeout(self.stage_timeout, fetch).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                error!(source_id, error = %e, "Fetch stage failed");
                return Err(e);
            }
            Err(_) => return Err(self.timed_out("fetch")),
        };
        stats.fetch_duration_ms = fetch_start.elapsed().as_millis() as u64;
        stats.records_fetched = records.len();
        info!(
            source_id,
            duration_ms = stats.fetch_duration_ms,
            records = stats.records_fetched,
            "Fetch completed"
        );

        // ====================================================================
        // Stage 2: Transform
        // ====================================================================

        let transform_start = Instant::now();
        let records = self.transformer.transform_records(records);
        stats.transform_duration_ms = transform_start.elapsed().as_millis() as u64;

        // ====================================================================
        // Stage 3: Persist
        // ====================================================================

        if !records.is_empty() {
            let persist_start = Instant::now();
            let outcome = match timeout(self.stage_timeout, self.store.save(records)).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!(source_id, error = %e, "Persist stage failed");
                    return Err(PipelineError::PersistFailed(e).into());
                }
                Err(_) => return Err(self.timed_out("persist")),
            };
            stats.persist_duration_ms = persist_start.elapsed().as_millis() as u64;
            stats.records_stored = outcome.inserted_count;
            stats.write_failures = outcome.failures.len();

            if stats.write_failures > 0 {
                warn!(
                    source_id,
                    failures = stats.write_failures,
                    first = %outcome.failures[0].message,
                    "Some records were not stored"
                );
            }
        }

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            source_id,
            duration_ms = stats.total_duration_ms,
            fetched = stats.records_fetched,
            stored = stats.records_stored,
            "Harvest completed"
        );

        let mut result = HarvestResult::succeeded(source_id, stats.records_fetched);
        result.stats = Some(stats);
        Ok(result)
    }

    fn timed_out(&self, stage: &str) -> HarvestError {
        error!(source_id = %self.source_id, stage, "Stage timed out");
        PipelineError::StageTimeout {
            stage: stage.to_string(),
            timeout_secs: self.stage_timeout.as_secs(),
        }
        .into()
    }
}

// ============================================================================
// Tests
// ============================================================================
