//! Retry policy for remote calls.
//!
//! Classification is a pure function of the error kind:
//! - `Connectivity`, `Timeout`: transient, retried with backoff
//! - `SessionExpired`: one reconnect, then one more try
//! - everything else: terminal, returned at once

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::RetryConfig;
use crate::error::PerfError;
use crate::session::ConnectionManager;
use crate::transport::{PerfTransport, SessionToken};

/// What to do after a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Reconnect,
    Fail,
}

pub fn classify(error: &PerfError) -> Disposition {
    match error {
        PerfError::Connectivity(_) | PerfError::Timeout(_) => Disposition::Retry,
        PerfError::SessionExpired(_) => Disposition::Reconnect,
        PerfError::Authentication(_)
        | PerfError::InvalidArgument(_)
        | PerfError::NotResolved
        | PerfError::NotConnected
        | PerfError::Protocol(_)
        | PerfError::Config(_) => Disposition::Fail,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; values below 1 are treated as 1.
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap: cap.max(base),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt + 1`, without jitter:
    /// `min(cap, base * 2^(attempt - 1))`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// `delay_for(attempt)` plus up to half of it again as jitter.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut seed = [0u8; 12];
        seed[..8].copy_from_slice(&nanos.to_le_bytes());
        seed[8..].copy_from_slice(&attempt.to_le_bytes());
        let permille = xxh3_64(&seed) % 1000;
        delay + delay.mul_f64(permille as f64 / 2000.0)
    }

    /// Runs `call` under `conn`'s session, applying the policy.
    ///
    /// Transient errors are retried until `max_attempts` tries have been
    /// made; the last one is returned unchanged. A session expiry triggers a
    /// single reconnect and one more try, which does not count as an
    /// attempt. A second expiry is returned as is.
    pub fn run<T, R, F>(
        &self,
        conn: &ConnectionManager<T>,
        operation: &'static str,
        mut call: F,
    ) -> Result<R, PerfError>
    where
        T: PerfTransport,
        F: FnMut(&T, &SessionToken) -> Result<R, PerfError>,
    {
        let mut attempt = 1u32;
        let mut reconnected = false;

        loop {
            let (generation, result) = conn.execute_tracked(|t, s| call(t, s));
            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match classify(&error) {
                Disposition::Fail => return Err(error),
                Disposition::Reconnect => {
                    if reconnected {
                        warn!(operation, error = %error, "session expired again after reconnect");
                        return Err(error);
                    }
                    reconnected = true;
                    info!(operation, generation, "session expired, reconnecting");
                    conn.reconnect(generation)?;
                }
                Disposition::Retry => {
                    if attempt >= self.max_attempts {
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %error,
                            "giving up after transient failures"
                        );
                        return Err(error);
                    }
                    let delay = self.jittered_delay(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::transport::MockTransport;
    use crate::transport::mock::MockOp;
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn connected(mock: &Arc<MockTransport>) -> ConnectionManager<Arc<MockTransport>> {
        let conn = ConnectionManager::new(mock.clone(), Credentials::new("monitor", "pw"));
        conn.connect().unwrap();
        conn
    }

    fn counters(conn: &ConnectionManager<Arc<MockTransport>>, policy: &RetryPolicy) -> Result<usize, PerfError> {
        policy.run(conn, "query_counters", |t, s| t.query_counters(s).map(|d| d.len()))
    }

    #[test]
    fn classification_is_fixed() {
        assert_eq!(classify(&PerfError::Connectivity("x".into())), Disposition::Retry);
        assert_eq!(classify(&PerfError::Timeout("x".into())), Disposition::Retry);
        assert_eq!(
            classify(&PerfError::SessionExpired("x".into())),
            Disposition::Reconnect
        );
        assert_eq!(classify(&PerfError::Authentication("x".into())), Disposition::Fail);
        assert_eq!(classify(&PerfError::InvalidArgument("x".into())), Disposition::Fail);
        assert_eq!(classify(&PerfError::NotResolved), Disposition::Fail);
        assert_eq!(classify(&PerfError::NotConnected), Disposition::Fail);
        assert_eq!(classify(&PerfError::Protocol("x".into())), Disposition::Fail);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        for attempt in 1..6 {
            let base = policy.delay_for(attempt);
            let d = policy.jittered_delay(attempt);
            assert!(d >= base);
            assert!(d <= base + base / 2);
        }
    }

    #[test]
    fn transient_failures_below_limit_succeed() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.fail_times(MockOp::QueryCounters, 2, PerfError::Timeout("slow".into()));

        assert_eq!(counters(&conn, &fast_policy(3)).unwrap(), 4);
        assert_eq!(mock.counter_calls(), 3);
    }

    #[test]
    fn exhausted_attempts_surface_last_error() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.fail_next(MockOp::QueryCounters, PerfError::Timeout("first".into()));
        mock.fail_next(MockOp::QueryCounters, PerfError::Connectivity("second".into()));
        mock.fail_next(MockOp::QueryCounters, PerfError::Connectivity("third".into()));

        let err = counters(&conn, &fast_policy(3)).unwrap_err();
        assert_eq!(err, PerfError::Connectivity("third".into()));
        assert_eq!(mock.counter_calls(), 3);
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.fail_next(MockOp::QueryCounters, PerfError::InvalidArgument("bad".into()));

        let err = counters(&conn, &fast_policy(5)).unwrap_err();
        assert_eq!(err, PerfError::InvalidArgument("bad".into()));
        assert_eq!(mock.counter_calls(), 1);
    }

    #[test]
    fn session_expiry_reconnects_once() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.expire_sessions();

        assert_eq!(counters(&conn, &fast_policy(1)).unwrap(), 4);
        assert_eq!(mock.login_calls(), 2);
        assert_eq!(mock.counter_calls(), 2);
        assert_eq!(conn.reconnect_count(), 1);
    }

    #[test]
    fn second_expiry_is_terminal() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.fail_times(
            MockOp::QueryCounters,
            2,
            PerfError::SessionExpired("not_authenticated".into()),
        );

        let err = counters(&conn, &fast_policy(3)).unwrap_err();
        assert!(matches!(err, PerfError::SessionExpired(_)));
        assert_eq!(mock.login_calls(), 2);
        assert_eq!(mock.counter_calls(), 2);
    }

    #[test]
    fn failed_reconnect_is_returned() {
        let mock = Arc::new(MockTransport::typical_endpoint());
        let conn = connected(&mock);
        mock.expire_sessions();
        mock.fail_next(MockOp::Login, PerfError::Authentication("locked".into()));

        let err = counters(&conn, &fast_policy(3)).unwrap_err();
        assert_eq!(err, PerfError::Authentication("locked".into()));
    }
}
