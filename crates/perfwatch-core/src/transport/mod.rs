//! Transport seam between the telemetry core and the management endpoint.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       PerfService                        │
//! │  ┌───────────────┐  ┌──────────────┐  ┌──────────────┐   │
//! │  │  StatsEngine  │─▶│ MetricCatalog│  │ Correlation  │   │
//! │  │               │  │              │  │    Cache     │   │
//! │  └───────┬───────┘  └──────┬───────┘  └──────────────┘   │
//! │          │   RetryPolicy   │                             │
//! │          └────────┬────────┘                             │
//! │          ┌────────▼──────────┐                           │
//! │          │ ConnectionManager │                           │
//! │          └────────┬──────────┘                           │
//! │          ┌────────▼──────────┐                           │
//! │          │  PerfTransport    │ (trait)                   │
//! │          └────────┬──────────┘                           │
//! └───────────────────┼──────────────────────────────────────┘
//!            ┌────────┴────────┐
//!     ┌──────▼──────┐   ┌──────▼──────┐
//!     │ TlsTransport│   │MockTransport│
//!     │ (JSON/TLS)  │   │ (Testing)   │
//!     └─────────────┘   └─────────────┘
//! ```

pub mod codec;
pub mod mock;
#[cfg(feature = "tls")]
mod tls;

pub use mock::MockTransport;
#[cfg(feature = "tls")]
pub use tls::TlsTransport;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::MetricDescriptor;
use crate::config::Credentials;
use crate::error::PerfError;
use crate::object::ObjectKey;

/// Opaque session token issued by the endpoint on login.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Tokens are bearer credentials; show only a prefix.
        let prefix: String = self.0.chars().take(4).collect();
        write!(f, "SessionToken({}…)", prefix)
    }
}

/// One batched performance query against a single managed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfQuery {
    pub entity: ObjectKey,
    pub counter_ids: Vec<i32>,
    /// Window start (exclusive). `None` asks for the most recent samples.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    pub end: DateTime<Utc>,
    pub interval_secs: u32,
    /// Samples per counter. `None` returns every sample in the window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_samples: Option<u32>,
}

/// A raw sample as the endpoint reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub counter_id: i32,
    /// Counter instance; empty for the aggregate over all instances.
    #[serde(default)]
    pub instance: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Remote calls the telemetry core needs from a management endpoint.
///
/// Implementations must be usable from many threads at once; every call
/// carries the session token so no per-connection login state is needed.
pub trait PerfTransport: Send + Sync {
    /// Opens a session.
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, PerfError>;

    /// Closes a session. Best effort; failures are ignored.
    fn logout(&self, session: &SessionToken);

    /// Lists every performance counter the endpoint supports.
    fn query_counters(&self, session: &SessionToken) -> Result<Vec<MetricDescriptor>, PerfError>;

    /// Runs one batched performance query.
    fn query_perf(
        &self,
        session: &SessionToken,
        query: &PerfQuery,
    ) -> Result<Vec<RawSample>, PerfError>;
}

impl<T: PerfTransport + ?Sized> PerfTransport for Arc<T> {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, PerfError> {
        (**self).login(credentials)
    }

    fn logout(&self, session: &SessionToken) {
        (**self).logout(session)
    }

    fn query_counters(&self, session: &SessionToken) -> Result<Vec<MetricDescriptor>, PerfError> {
        (**self).query_counters(session)
    }

    fn query_perf(
        &self,
        session: &SessionToken,
        query: &PerfQuery,
    ) -> Result<Vec<RawSample>, PerfError> {
        (**self).query_perf(session, query)
    }
}

impl<T: PerfTransport + ?Sized> PerfTransport for Box<T> {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, PerfError> {
        (**self).login(credentials)
    }

    fn logout(&self, session: &SessionToken) {
        (**self).logout(session)
    }

    fn query_counters(&self, session: &SessionToken) -> Result<Vec<MetricDescriptor>, PerfError> {
        (**self).query_counters(session)
    }

    fn query_perf(
        &self,
        session: &SessionToken,
        query: &PerfQuery,
    ) -> Result<Vec<RawSample>, PerfError> {
        (**self).query_perf(session, query)
    }
}
