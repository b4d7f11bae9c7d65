//! Stats query engine: turns raw endpoint samples into metric records.
//!
//! For each request the engine
//! 1. checks the key's type tag against the requested entity kind,
//! 2. takes the per-object correlation entry (applicable counter ids and the
//!    last query cursor), computing it at most once per object,
//! 3. issues one batched query for all applicable counters,
//! 4. maps every returned sample to its descriptor; samples with unknown
//!    counter ids are dropped and counted,
//! 5. advances the object's cursor to the query end time.
//!
//! Records are returned in the order the endpoint reported them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cache::CorrelationCache;
use crate::catalog::{CounterSet, MetricCatalog};
use crate::config::QueryConfig;
use crate::error::{PerfError, StatsError};
use crate::object::{EntityKind, ObjectKey};
use crate::retry::RetryPolicy;
use crate::session::ConnectionManager;
use crate::transport::{PerfQuery, PerfTransport, RawSample};

/// Which samples a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// The most recent sample of every counter on each call.
    #[default]
    Latest,
    /// Every sample since the previous call for the same object. The first
    /// call for an object behaves like `Latest`.
    Incremental,
}

/// A normalized, timestamped counter value for one managed object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub name: String,
    pub unit: String,
    /// Counter instance; empty for the aggregate.
    pub instance: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub source: ObjectKey,
}

/// Per-object query state kept in the correlation cache.
#[derive(Debug)]
pub struct CorrelationEntry {
    metric_ids: Vec<i32>,
    last_query: Mutex<Option<DateTime<Utc>>>,
}

impl CorrelationEntry {
    pub fn new(metric_ids: Vec<i32>) -> Self {
        Self {
            metric_ids,
            last_query: Mutex::new(None),
        }
    }

    pub fn metric_ids(&self) -> &[i32] {
        &self.metric_ids
    }

    /// End time of the last successful query for this object.
    pub fn last_query(&self) -> Option<DateTime<Utc>> {
        *self.last_query.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the cursor forward to `end`. Never moves it back.
    fn advance(&self, end: DateTime<Utc>) {
        let mut cursor = self.last_query.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.is_none_or(|c| c < end) {
            *cursor = Some(end);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub mode: QueryMode,
    pub max_window: chrono::Duration,
    pub interval_secs: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

impl QueryOptions {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            mode: config.mode,
            max_window: i64::try_from(config.max_window_secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or(chrono::Duration::MAX),
            interval_secs: config.interval_secs,
        }
    }

    /// Builds the batched query for `key` ending at `end`.
    fn build(
        &self,
        key: &ObjectKey,
        entry: &CorrelationEntry,
        end: DateTime<Utc>,
    ) -> PerfQuery {
        let cursor = match self.mode {
            QueryMode::Latest => None,
            QueryMode::Incremental => entry.last_query(),
        };
        let (start, max_samples) = match cursor {
            Some(cursor) => {
                let start = end
                    .checked_sub_signed(self.max_window)
                    .map_or(cursor, |floor| cursor.max(floor));
                (Some(start), None)
            }
            None => (None, Some(1)),
        };
        PerfQuery {
            entity: key.clone(),
            counter_ids: entry.metric_ids.clone(),
            start,
            end,
            interval_secs: self.interval_secs,
            max_samples,
        }
    }
}

pub struct StatsEngine<T: PerfTransport> {
    conn: Arc<ConnectionManager<T>>,
    catalog: MetricCatalog,
    cache: CorrelationCache<CorrelationEntry>,
    retry: RetryPolicy,
    options: QueryOptions,
    dropped: AtomicU64,
}

impl<T: PerfTransport> StatsEngine<T> {
    pub fn new(
        conn: Arc<ConnectionManager<T>>,
        catalog: MetricCatalog,
        retry: RetryPolicy,
        options: QueryOptions,
    ) -> Self {
        Self {
            conn,
            catalog,
            cache: CorrelationCache::new(),
            retry,
            options,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.conn
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    pub fn cache(&self) -> &CorrelationCache<CorrelationEntry> {
        &self.cache
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Resolves the counter catalog for the current session.
    pub fn resolve_catalog(&self) -> Result<Arc<CounterSet>, PerfError> {
        self.catalog.resolve(&self.conn, &self.retry)
    }

    /// Total samples dropped because their counter id had no descriptor.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forgets the catalog and every per-object entry.
    pub fn reset(&self) {
        self.catalog.reset();
        self.cache.clear();
    }

    pub fn retrieve_vm_metrics(&self, id: &str) -> Result<Vec<MetricRecord>, StatsError> {
        let key = ObjectKey::vm(id).map_err(|e| invalid_key(EntityKind::VirtualMachine, id, e))?;
        self.retrieve_metrics(&key, EntityKind::VirtualMachine)
    }

    pub fn retrieve_host_metrics(&self, id: &str) -> Result<Vec<MetricRecord>, StatsError> {
        let key = ObjectKey::host(id).map_err(|e| invalid_key(EntityKind::Host, id, e))?;
        self.retrieve_metrics(&key, EntityKind::Host)
    }

    /// Retrieves current metrics for one managed object.
    pub fn retrieve_metrics(
        &self,
        key: &ObjectKey,
        kind: EntityKind,
    ) -> Result<Vec<MetricRecord>, StatsError> {
        if key.type_tag() != kind.type_tag() {
            return Err(StatsError::new(
                key,
                "retrieve_metrics",
                PerfError::InvalidArgument(format!(
                    "object type {} does not match kind {} (expected {})",
                    key.type_tag(),
                    kind,
                    kind.type_tag()
                )),
            ));
        }

        let counters = self
            .resolve_catalog()
            .map_err(|e| StatsError::new(key, "resolve_catalog", e))?;

        let entry = self
            .correlation_entry(key, kind, &counters)
            .map_err(|e| StatsError::new(key, "resolve_counters", e))?;

        if entry.metric_ids().is_empty() {
            return Ok(Vec::new());
        }

        let query = self.options.build(key, &entry, Utc::now());
        let samples = self
            .retry
            .run(&self.conn, "query_perf", |transport, session| {
                transport.query_perf(session, &query)
            })
            .map_err(|e| StatsError::new(key, "query_perf", e))?;

        let records = self.normalize(key, &counters, samples);
        entry.advance(query.end);
        Ok(records)
    }

    /// Cached entry for `key`, created from `counters` on first use.
    ///
    /// Fails with `NotResolved` when the catalog was reset after `counters`
    /// was resolved, so no entry built from a discarded catalog is stored.
    fn correlation_entry(
        &self,
        key: &ObjectKey,
        kind: EntityKind,
        counters: &CounterSet,
    ) -> Result<Arc<CorrelationEntry>, PerfError> {
        self.cache.get_or_try_insert_with(key, || {
            if self.catalog.epoch() != counters.epoch() {
                return Err(PerfError::NotResolved);
            }
            let ids = counters.applicable_ids(kind).to_vec();
            debug!(object = %key, counters = ids.len(), "correlation entry created");
            Ok(CorrelationEntry::new(ids))
        })
    }

    /// Maps raw samples to records, dropping samples without a descriptor.
    fn normalize(
        &self,
        key: &ObjectKey,
        counters: &CounterSet,
        samples: Vec<RawSample>,
    ) -> Vec<MetricRecord> {
        let total = samples.len();
        let mut dropped = 0u64;
        let records: Vec<MetricRecord> = samples
            .into_iter()
            .filter_map(|sample| {
                let Some(descriptor) = counters.get(sample.counter_id) else {
                    dropped += 1;
                    trace!(object = %key, counter_id = sample.counter_id, "sample without descriptor");
                    return None;
                };
                Some(MetricRecord {
                    name: descriptor.name.clone(),
                    unit: descriptor.unit.clone(),
                    instance: sample.instance,
                    value: sample.value,
                    timestamp: sample.timestamp,
                    source: key.clone(),
                })
            })
            .collect();

        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            debug!(object = %key, total, dropped, "dropped samples with unknown counter ids");
        }
        records
    }
}

/// An id `ObjectKey` rejects cannot name the object, so report under a placeholder.
fn invalid_key(kind: EntityKind, id: &str, error: PerfError) -> StatsError {
    debug!(kind = %kind, id, error = %error, "invalid object id");
    let key = ObjectKey::from_static(kind.type_tag(), "<invalid>");
    StatsError::new(&key, "retrieve_metrics", error)
}
