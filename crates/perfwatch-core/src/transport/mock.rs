//! In-memory management endpoint for tests.
//!
//! Holds a counter catalog and per-object samples, issues session tokens,
//! and lets tests inject failures per operation and count remote calls.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use super::{PerfQuery, PerfTransport, RawSample, SessionToken};
use crate::catalog::{MetricDescriptor, Rollup};
use crate::config::Credentials;
use crate::error::PerfError;
use crate::object::{EntityKind, ObjectKey};

/// Remote operation a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Login,
    QueryCounters,
    QueryPerf,
}

#[derive(Default)]
struct MockState {
    credentials: Option<Credentials>,
    descriptors: Vec<MetricDescriptor>,
    samples: HashMap<ObjectKey, Vec<RawSample>>,
    failures: HashMap<MockOp, VecDeque<PerfError>>,
    tokens: HashSet<String>,
    next_token: u64,
    queries: Vec<PerfQuery>,
    counters_delay: Duration,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    counter_calls: AtomicUsize,
    perf_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept only these credentials on login. Any credentials are accepted otherwise.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.state().credentials = Some(credentials);
        self
    }

    pub fn with_descriptor(self, descriptor: MetricDescriptor) -> Self {
        self.state().descriptors.push(descriptor);
        self
    }

    /// Registers an object and the samples the endpoint reports for it.
    pub fn with_object(self, key: ObjectKey, samples: Vec<RawSample>) -> Self {
        self.set_samples(key, samples);
        self
    }

    pub fn set_samples(&self, key: ObjectKey, samples: Vec<RawSample>) {
        self.state().samples.insert(key, samples);
    }

    /// Fails the next call of `op` with `error`.
    pub fn fail_next(&self, op: MockOp, error: PerfError) {
        self.fail_times(op, 1, error);
    }

    /// Fails the next `times` calls of `op` with `error`.
    pub fn fail_times(&self, op: MockOp, times: usize, error: PerfError) {
        let mut state = self.state();
        let queue = state.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// Invalidates every issued token, as a server-side session timeout would.
    pub fn expire_sessions(&self) {
        self.state().tokens.clear();
    }

    /// Makes the counter catalog query take at least `delay`.
    pub fn set_counters_delay(&self, delay: Duration) {
        self.state().counters_delay = delay;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn counter_calls(&self) -> usize {
        self.counter_calls.load(Ordering::SeqCst)
    }

    pub fn perf_calls(&self) -> usize {
        self.perf_calls.load(Ordering::SeqCst)
    }

    /// Every performance query received, in arrival order.
    pub fn recorded_queries(&self) -> Vec<PerfQuery> {
        self.state().queries.clone()
    }

    fn take_failure(state: &mut MockState, op: MockOp) -> Option<PerfError> {
        state.failures.get_mut(&op).and_then(|q| q.pop_front())
    }

    fn check_session(state: &MockState, session: &SessionToken) -> Result<(), PerfError> {
        if state.tokens.contains(session.as_str()) {
            Ok(())
        } else {
            Err(PerfError::SessionExpired("not_authenticated".to_string()))
        }
    }
}

impl PerfTransport for MockTransport {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, PerfError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(error) = Self::take_failure(&mut state, MockOp::Login) {
            return Err(error);
        }
        if let Some(expected) = &state.credentials
            && expected != credentials
        {
            return Err(PerfError::Authentication(format!(
                "invalid_login: user {}",
                credentials.username
            )));
        }
        state.next_token += 1;
        let token = format!("mock-session-{}", state.next_token);
        state.tokens.insert(token.clone());
        Ok(SessionToken::new(token))
    }

    fn logout(&self, session: &SessionToken) {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        self.state().tokens.remove(session.as_str());
    }

    fn query_counters(&self, session: &SessionToken) -> Result<Vec<MetricDescriptor>, PerfError> {
        self.counter_calls.fetch_add(1, Ordering::SeqCst);
        let delay = {
            let mut state = self.state();
            if let Some(error) = Self::take_failure(&mut state, MockOp::QueryCounters) {
                return Err(error);
            }
            Self::check_session(&state, session)?;
            state.counters_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        Ok(self.state().descriptors.clone())
    }

    fn query_perf(
        &self,
        session: &SessionToken,
        query: &PerfQuery,
    ) -> Result<Vec<RawSample>, PerfError> {
        self.perf_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        state.queries.push(query.clone());
        if let Some(error) = Self::take_failure(&mut state, MockOp::QueryPerf) {
            return Err(error);
        }
        Self::check_session(&state, session)?;

        let Some(samples) = state.samples.get(&query.entity) else {
            return Err(PerfError::InvalidArgument(format!(
                "invalid_object: {}",
                query.entity
            )));
        };

        Ok(samples
            .iter()
            .filter(|s| query.start.is_none_or(|start| s.timestamp > start))
            .filter(|s| s.timestamp <= query.end)
            .cloned()
            .collect())
    }
}

/// Fixed sample time used by the canned scenarios.
pub fn scenario_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

fn descriptor(
    id: i32,
    group: &str,
    name: &str,
    unit: &str,
    rollup: Rollup,
    level: u8,
    kinds: &[EntityKind],
) -> MetricDescriptor {
    MetricDescriptor {
        id,
        group: group.to_string(),
        name: name.to_string(),
        unit: unit.to_string(),
        rollup,
        level,
        applies_to: kinds.iter().copied().collect::<BTreeSet<_>>(),
    }
}

fn sample(counter_id: i32, instance: &str, timestamp: DateTime<Utc>, value: f64) -> RawSample {
    RawSample {
        counter_id,
        instance: instance.to_string(),
        timestamp,
        value,
    }
}

impl MockTransport {
    /// A small endpoint with one VM and one host.
    ///
    /// Counters:
    /// - 1 `cpu.usage` (%) VM and host, level 1
    /// - 2 `mem.active` (KB) VM and host, level 2
    /// - 3 `net.received` (KBps) VM only, level 3
    /// - 4 `disk.deviceLatency` (ms) host only, level 4
    ///
    /// Objects: `VirtualMachine:vm-49`, `HostSystem:host-12`.
    pub fn typical_endpoint() -> Self {
        let both = [EntityKind::VirtualMachine, EntityKind::Host];
        let t = scenario_time();
        Self::new()
            .with_descriptor(descriptor(1, "cpu", "cpu.usage", "%", Rollup::Average, 1, &both))
            .with_descriptor(descriptor(2, "mem", "mem.active", "KB", Rollup::Average, 2, &both))
            .with_descriptor(descriptor(
                3,
                "net",
                "net.received",
                "KBps",
                Rollup::Average,
                3,
                &[EntityKind::VirtualMachine],
            ))
            .with_descriptor(descriptor(
                4,
                "disk",
                "disk.deviceLatency",
                "ms",
                Rollup::Latest,
                4,
                &[EntityKind::Host],
            ))
            .with_object(
                ObjectKey::from_static("VirtualMachine", "vm-49"),
                vec![
                    sample(1, "", t, 42.0),
                    sample(2, "", t, 1_048_576.0),
                    sample(3, "vmnic0", t, 12.5),
                ],
            )
            .with_object(
                ObjectKey::from_static("HostSystem", "host-12"),
                vec![
                    sample(1, "", t, 17.25),
                    sample(1, "0", t, 20.0),
                    sample(1, "1", t, 14.5),
                    sample(4, "naa.600", t, 3.0),
                ],
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_issues_distinct_tokens() {
        let mock = MockTransport::new();
        let a = mock.login(&Credentials::new("u", "p")).unwrap();
        let b = mock.login(&Credentials::new("u", "p")).unwrap();
        assert_ne!(a, b);
        assert_eq!(mock.login_calls(), 2);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mock = MockTransport::typical_endpoint();
        let token = mock.login(&Credentials::new("u", "p")).unwrap();
        assert!(mock.query_counters(&token).is_ok());

        mock.expire_sessions();
        assert!(matches!(
            mock.query_counters(&token),
            Err(PerfError::SessionExpired(_))
        ));
    }

    #[test]
    fn injected_failures_are_consumed_in_order() {
        let mock = MockTransport::typical_endpoint();
        let token = mock.login(&Credentials::new("u", "p")).unwrap();
        mock.fail_times(MockOp::QueryCounters, 2, PerfError::Timeout("slow".into()));

        assert!(mock.query_counters(&token).is_err());
        assert!(mock.query_counters(&token).is_err());
        assert_eq!(mock.query_counters(&token).unwrap().len(), 4);
        assert_eq!(mock.counter_calls(), 3);
    }

    #[test]
    fn unknown_object_is_invalid_argument() {
        let mock = MockTransport::typical_endpoint();
        let token = mock.login(&Credentials::new("u", "p")).unwrap();
        let query = PerfQuery {
            entity: ObjectKey::vm("vm-404").unwrap(),
            counter_ids: vec![1],
            start: None,
            end: scenario_time(),
            interval_secs: 20,
            max_samples: Some(1),
        };
        assert!(matches!(
            mock.query_perf(&token, &query),
            Err(PerfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn query_window_filters_samples() {
        let mock = MockTransport::typical_endpoint();
        let token = mock.login(&Credentials::new("u", "p")).unwrap();
        let mut query = PerfQuery {
            entity: ObjectKey::vm("vm-49").unwrap(),
            counter_ids: vec![1, 2, 3],
            start: None,
            end: scenario_time(),
            interval_secs: 20,
            max_samples: Some(1),
        };
        assert_eq!(mock.query_perf(&token, &query).unwrap().len(), 3);

        query.start = Some(scenario_time());
        assert!(mock.query_perf(&token, &query).unwrap().is_empty());
        assert_eq!(mock.recorded_queries().len(), 2);
    }
}
