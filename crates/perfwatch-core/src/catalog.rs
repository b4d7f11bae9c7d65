//! Performance counter catalog.
//!
//! The endpoint's counter list is fetched once per session. Resolution is
//! single-flight: callers arriving while a fetch is in progress wait for it
//! and share its outcome instead of issuing their own query. Once resolved,
//! the catalog is an immutable `CounterSet` shared by every stats query until
//! `reset()` is called on session teardown.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PerfError;
use crate::object::EntityKind;
use crate::retry::RetryPolicy;
use crate::session::ConnectionManager;
use crate::transport::PerfTransport;

/// How the endpoint rolls samples up within an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rollup {
    #[default]
    None,
    Average,
    Summation,
    Latest,
    Minimum,
    Maximum,
}

fn default_level() -> u8 {
    1
}

/// Description of one performance counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub id: i32,
    pub group: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub rollup: Rollup,
    /// Statistics collection level (1 = always collected, 4 = most detailed).
    #[serde(default = "default_level")]
    pub level: u8,
    pub applies_to: BTreeSet<EntityKind>,
}

impl MetricDescriptor {
    pub fn is_applicable(&self, kind: EntityKind) -> bool {
        self.applies_to.contains(&kind)
    }
}

/// Resolved catalog: descriptors by id plus per-kind applicable ids.
#[derive(Debug, Default)]
pub struct CounterSet {
    by_id: HashMap<i32, Arc<MetricDescriptor>>,
    by_kind: HashMap<EntityKind, Vec<i32>>,
    epoch: u64,
}

impl CounterSet {
    /// Builds the set, keeping only counters at or below `max_level`.
    ///
    /// Duplicate ids keep the first descriptor.
    pub fn build(descriptors: Vec<MetricDescriptor>, max_level: u8) -> Self {
        let mut set = CounterSet::default();
        let mut skipped = 0usize;
        for d in descriptors {
            if d.level > max_level {
                skipped += 1;
                continue;
            }
            if set.by_id.contains_key(&d.id) {
                warn!(counter_id = d.id, name = %d.name, "duplicate counter id ignored");
                continue;
            }
            for kind in &d.applies_to {
                set.by_kind.entry(*kind).or_default().push(d.id);
            }
            set.by_id.insert(d.id, Arc::new(d));
        }
        for ids in set.by_kind.values_mut() {
            ids.sort_unstable();
        }
        if skipped > 0 {
            debug!(skipped, max_level, "counters above statistics level skipped");
        }
        set
    }

    pub fn get(&self, id: i32) -> Option<&Arc<MetricDescriptor>> {
        self.by_id.get(&id)
    }

    /// Ids of counters that apply to `kind`, ascending.
    pub fn applicable_ids(&self, kind: EntityKind) -> &[i32] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Descriptors of counters that apply to `kind`, ascending by id.
    pub fn descriptors(&self, kind: EntityKind) -> Vec<Arc<MetricDescriptor>> {
        self.applicable_ids(kind)
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }

    /// Catalog epoch this set was resolved in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

enum CatalogState {
    Empty,
    Resolving,
    Ready(Arc<CounterSet>),
    Failed(PerfError),
}

struct Inner {
    state: CatalogState,
    /// Bumped on `reset()` so a fetch started for an old session is not stored.
    epoch: u64,
}

pub struct MetricCatalog {
    inner: Mutex<Inner>,
    changed: Condvar,
    max_level: u8,
    fetches: AtomicU64,
}

/// Puts the catalog back to `Empty` if a fetch is abandoned by a panic.
struct ResolveGuard<'a> {
    catalog: &'a MetricCatalog,
    epoch: u64,
    armed: bool,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.catalog.lock();
        if inner.epoch == self.epoch && matches!(inner.state, CatalogState::Resolving) {
            inner.state = CatalogState::Empty;
        }
        self.catalog.changed.notify_all();
    }
}

impl MetricCatalog {
    /// Creates an empty catalog keeping counters up to statistics `max_level`.
    pub fn new(max_level: u8) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CatalogState::Empty,
                epoch: 0,
            }),
            changed: Condvar::new(),
            max_level,
            fetches: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves the catalog through `conn`, retrying per `retry`.
    pub fn resolve<T: PerfTransport>(
        &self,
        conn: &ConnectionManager<T>,
        retry: &RetryPolicy,
    ) -> Result<Arc<CounterSet>, PerfError> {
        self.resolve_with(|| {
            retry.run(conn, "query_counters", |transport, session| {
                transport.query_counters(session)
            })
        })
    }

    /// Resolves the catalog with `fetch`, unless already resolved.
    ///
    /// Callers that arrive while another fetch is running wait for it and
    /// return its result. A failed fetch leaves the catalog unresolved.
    pub fn resolve_with<F>(&self, fetch: F) -> Result<Arc<CounterSet>, PerfError>
    where
        F: FnOnce() -> Result<Vec<MetricDescriptor>, PerfError>,
    {
        let mut inner = self.lock();
        let mut waited = false;
        loop {
            match &inner.state {
                CatalogState::Ready(set) => return Ok(set.clone()),
                CatalogState::Failed(e) if waited => return Err(e.clone()),
                CatalogState::Empty | CatalogState::Failed(_) => break,
                CatalogState::Resolving => {}
            }
            waited = true;
            inner = self
                .changed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }

        inner.state = CatalogState::Resolving;
        let mut guard = ResolveGuard {
            catalog: self,
            epoch: inner.epoch,
            armed: true,
        };
        drop(inner);

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let result = fetch();

        let mut inner = self.lock();
        guard.armed = false;
        let current = inner.epoch == guard.epoch;
        let outcome = match result {
            Ok(descriptors) => {
                let total = descriptors.len();
                let mut set = CounterSet::build(descriptors, self.max_level);
                set.epoch = guard.epoch;
                let set = Arc::new(set);
                info!(
                    total,
                    usable = set.len(),
                    vm = set.applicable_ids(EntityKind::VirtualMachine).len(),
                    host = set.applicable_ids(EntityKind::Host).len(),
                    "metric catalog resolved"
                );
                if current {
                    inner.state = CatalogState::Ready(set.clone());
                }
                Ok(set)
            }
            Err(e) => {
                warn!(error = %e, "metric catalog resolution failed");
                if current {
                    inner.state = CatalogState::Failed(e.clone());
                }
                Err(e)
            }
        };
        drop(inner);
        self.changed.notify_all();
        outcome
    }

    /// The resolved counter set.
    pub fn counters(&self) -> Result<Arc<CounterSet>, PerfError> {
        match &self.lock().state {
            CatalogState::Ready(set) => Ok(set.clone()),
            _ => Err(PerfError::NotResolved),
        }
    }

    /// Descriptors applicable to `kind`. Fails with `NotResolved` until a
    /// resolution has succeeded.
    pub fn descriptors_for(&self, kind: EntityKind) -> Result<Vec<Arc<MetricDescriptor>>, PerfError> {
        Ok(self.counters()?.descriptors(kind))
    }

    /// Looks up one descriptor by counter id.
    pub fn lookup(&self, id: i32) -> Result<Option<Arc<MetricDescriptor>>, PerfError> {
        Ok(self.counters()?.get(id).cloned())
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.lock().state, CatalogState::Ready(_))
    }

    /// Forgets the resolved catalog. In-flight fetches finish but are not stored.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.epoch += 1;
        inner.state = CatalogState::Empty;
        drop(inner);
        self.changed.notify_all();
    }

    /// Incremented by every `reset`. A `CounterSet` from an older epoch is stale.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Number of usable counters, or 0 while unresolved.
    pub fn len(&self) -> usize {
        self.counters().map_or(0, |set| set.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of remote fetches started since creation.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn descriptor(id: i32, name: &str, unit: &str, level: u8, kinds: &[EntityKind]) -> MetricDescriptor {
        MetricDescriptor {
            id,
            group: name.split('.').next().unwrap_or_default().to_string(),
            name: name.to_string(),
            unit: unit.to_string(),
            rollup: Rollup::Average,
            level,
            applies_to: kinds.iter().copied().collect(),
        }
    }

    fn sample_catalog() -> Vec<MetricDescriptor> {
        vec![
            descriptor(2, "mem.active", "KB", 1, &[EntityKind::VirtualMachine, EntityKind::Host]),
            descriptor(1, "cpu.usage", "%", 1, &[EntityKind::VirtualMachine, EntityKind::Host]),
            descriptor(5, "disk.deviceLatency", "ms", 2, &[EntityKind::Host]),
            descriptor(9, "cpu.ready", "ms", 4, &[EntityKind::VirtualMachine]),
        ]
    }

    #[test]
    fn descriptors_before_resolve_fail() {
        let catalog = MetricCatalog::new(4);
        assert_eq!(
            catalog.descriptors_for(EntityKind::VirtualMachine).unwrap_err(),
            PerfError::NotResolved
        );
        assert!(!catalog.is_resolved());
    }

    #[test]
    fn resolve_filters_by_kind() {
        let catalog = MetricCatalog::new(4);
        catalog.resolve_with(|| Ok(sample_catalog())).unwrap();

        let vm: Vec<i32> = catalog
            .descriptors_for(EntityKind::VirtualMachine)
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(vm, vec![1, 2, 9]);

        let host: Vec<i32> = catalog
            .descriptors_for(EntityKind::Host)
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(host, vec![1, 2, 5]);

        assert_eq!(catalog.lookup(5).unwrap().unwrap().unit, "ms");
        assert!(catalog.lookup(99).unwrap().is_none());
    }

    #[test]
    fn max_level_excludes_detailed_counters() {
        let catalog = MetricCatalog::new(1);
        let set = catalog.resolve_with(|| Ok(sample_catalog())).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.applicable_ids(EntityKind::Host), &[1, 2]);
        assert!(set.get(9).is_none());
    }

    #[test]
    fn second_resolve_is_served_from_cache() {
        let catalog = MetricCatalog::new(4);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            catalog
                .resolve_with(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_catalog())
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.fetch_count(), 1);
    }

    #[test]
    fn failed_resolve_leaves_catalog_unresolved_until_success() {
        let catalog = MetricCatalog::new(4);
        let err = catalog
            .resolve_with(|| Err(PerfError::Timeout("counters".into())))
            .unwrap_err();
        assert_eq!(err, PerfError::Timeout("counters".into()));

        for _ in 0..3 {
            assert_eq!(
                catalog.descriptors_for(EntityKind::Host).unwrap_err(),
                PerfError::NotResolved
            );
        }

        catalog.resolve_with(|| Ok(sample_catalog())).unwrap();
        assert!(catalog.descriptors_for(EntityKind::Host).is_ok());
    }

    #[test]
    fn concurrent_resolves_are_coalesced() {
        let catalog = Arc::new(MetricCatalog::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let catalog = catalog.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    catalog
                        .resolve_with(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Ok(sample_catalog())
                        })
                        .map(|set| set.len())
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 4);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_share_a_failed_resolution() {
        let catalog = Arc::new(MetricCatalog::new(4));
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let catalog = catalog.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    catalog
                        .resolve_with(|| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(100));
                            Err(PerfError::Connectivity("down".into()))
                        })
                        .map(|set| set.len())
                })
            })
            .collect();

        for h in handles {
            assert_eq!(
                h.join().unwrap().unwrap_err(),
                PerfError::Connectivity("down".into())
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!catalog.is_resolved());
    }

    #[test]
    fn reset_discards_catalog() {
        let catalog = MetricCatalog::new(4);
        catalog.resolve_with(|| Ok(sample_catalog())).unwrap();
        assert_eq!(catalog.len(), 4);
        catalog.reset();
        assert!(!catalog.is_resolved());
        assert!(catalog.is_empty());
        assert_eq!(catalog.counters().unwrap_err(), PerfError::NotResolved);
    }

    #[test]
    fn resolved_sets_carry_their_epoch() {
        let catalog = MetricCatalog::new(4);
        let first = catalog.resolve_with(|| Ok(sample_catalog())).unwrap();
        assert_eq!(first.epoch(), catalog.epoch());

        catalog.reset();
        assert_ne!(first.epoch(), catalog.epoch());
        let second = catalog.resolve_with(|| Ok(sample_catalog())).unwrap();
        assert_eq!(second.epoch(), catalog.epoch());
    }

    #[test]
    fn duplicate_ids_keep_first() {
        let set = CounterSet::build(
            vec![
                descriptor(1, "cpu.usage", "%", 1, &[EntityKind::Host]),
                descriptor(1, "cpu.other", "ms", 1, &[EntityKind::Host]),
            ],
            4,
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(1).unwrap().name, "cpu.usage");
        assert_eq!(set.applicable_ids(EntityKind::Host), &[1]);
    }
}
