mod conflict;
mod error;
mod mutations;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use conflict::{
    ConflictReport, Overlap, OverlapClass, Verdict, check_overlaps, first_self_overlap,
};
pub use error::{EngineError, StoreError};
pub use store::{EventStore, InMemoryStore};

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;
use crate::recurrence::StandardCron;
use crate::wal::Wal;

/// The scheduling engine: validated, logged, atomic batches over the
/// in-memory store.
///
/// Writers are serialized on the log lock, so validate-append-apply never
/// interleaves. Readers go straight to the DashMap-backed store.
pub struct Engine {
    store: InMemoryStore,
    wal: Mutex<Wal>,
    config: Config,
    evaluator: StandardCron,
}

impl Engine {
    /// Open the log at `path` with default settings.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Self::open_at(path, Config::default())
    }

    /// Open the log in the configured data directory.
    pub fn with_config(config: Config) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.wal_path();
        Self::open_at(&path, config)
    }

    fn open_at(path: &Path, config: Config) -> std::io::Result<Self> {
        let (wal, batches) = Wal::open(path)?;
        let store = InMemoryStore::new();

        // Everything in the log was validated before it was written.
        for batch in &batches {
            store.apply_batch(batch);
        }
        info!(
            path = %path.display(),
            batches = batches.len(),
            resources = store.resource_count(),
            "log replayed"
        );

        Ok(Self {
            store,
            wal: Mutex::new(wal),
            config,
            evaluator: StandardCron,
        })
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn evaluator(&self) -> &StandardCron {
        &self.evaluator
    }

    pub(super) fn lock_wal(&self) -> MutexGuard<'_, Wal> {
        self.wal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate, log and apply one batch. The caller holds the log lock.
    pub(super) fn commit(&self, wal: &mut Wal, batch: &Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.store.validate(batch) {
            let reason = match &e {
                StoreError::StaleSeries { .. } => "stale_series",
                StoreError::NotFound(_) => "not_found",
                StoreError::AlreadyExists(_) => "already_exists",
                StoreError::LimitExceeded(_) => "limit_exceeded",
                StoreError::Wal(_) => "wal",
            };
            metrics::counter!(crate::observability::BATCHES_REJECTED_TOTAL, "reason" => reason)
                .increment(1);
            debug!(error = %e, mutations = batch.len(), "batch rejected");
            return Err(e);
        }

        let started = Instant::now();
        if let Err(e) = wal.append(batch) {
            warn!(error = %e, "log append failed, batch not applied");
            return Err(e.into());
        }
        metrics::histogram!(crate::observability::WAL_APPEND_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        self.store.apply_batch(batch);
        let first = batch.mutations.first().map_or("empty", Mutation::label);
        metrics::counter!(crate::observability::BATCHES_APPLIED_TOTAL, "first" => first)
            .increment(1);
        metrics::histogram!(crate::observability::BATCH_SIZE).record(batch.len() as f64);
        Ok(())
    }

    /// Rewrite the log as the smallest set of batches recreating the
    /// current state.
    pub fn compact(&self) -> Result<(), EngineError> {
        let mut wal = self.lock_wal();
        let batches = self.store.snapshot();
        let replaced = wal.appends_since_compact();
        wal.compact(&batches).map_err(StoreError::from)?;
        info!(batches = batches.len(), replaced, "log compacted");
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.lock_wal().appends_since_compact()
    }

    pub(super) fn rules(&self, id: Ulid) -> Result<ResourceRules, EngineError> {
        self.store.get_rules(id).ok_or(EngineError::NotFound(id))
    }
}

impl EventStore for Engine {
    fn apply(&self, batch: &Batch) -> Result<(), StoreError> {
        let mut wal = self.lock_wal();
        self.commit(&mut wal, batch)
    }

    /// `check` runs under the log lock: no booking can land between it and
    /// the commit.
    fn apply_checked(
        &self,
        batch: &Batch,
        check: &mut dyn FnMut() -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut wal = self.lock_wal();
        check()?;
        Ok(self.commit(&mut wal, batch)?)
    }

    fn event(&self, id: Ulid) -> Option<ScheduleEvent> {
        self.store.get_event(id)
    }

    fn series(&self, id: Ulid) -> Option<SeriesRecord> {
        self.store.get_series(id)
    }

    fn series_instances(&self, id: Ulid) -> Vec<ScheduleEvent> {
        self.store.get_series_instances(id)
    }

    fn events_for(&self, resource_id: Ulid, span: &Span) -> Vec<ScheduleEvent> {
        self.store.get_events_for(resource_id, span)
    }

    fn resource(&self, id: Ulid) -> Option<ResourceRules> {
        self.store.get_rules(id)
    }
}

impl EventStore for InMemoryStore {
    /// Unlogged apply, for tests and tools that need no durability.
    fn apply(&self, batch: &Batch) -> Result<(), StoreError> {
        self.validate(batch)?;
        self.apply_batch(batch);
        Ok(())
    }

    fn event(&self, id: Ulid) -> Option<ScheduleEvent> {
        self.get_event(id)
    }

    fn series(&self, id: Ulid) -> Option<SeriesRecord> {
        self.get_series(id)
    }

    fn series_instances(&self, id: Ulid) -> Vec<ScheduleEvent> {
        self.get_series_instances(id)
    }

    fn events_for(&self, resource_id: Ulid, span: &Span) -> Vec<ScheduleEvent> {
        self.get_events_for(resource_id, span)
    }

    fn resource(&self, id: Ulid) -> Option<ResourceRules> {
        self.get_rules(id)
    }
}
