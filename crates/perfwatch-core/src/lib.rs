//! perfwatch-core: performance telemetry client for virtualization
//! management endpoints.
//!
//! Provides:
//! - `session`: authenticated session with generation-tracked reconnects
//! - `object`: managed-object keys and entity kinds
//! - `cache`: per-object correlation cache with at-most-once computation
//! - `catalog`: single-flight counter catalog resolution
//! - `stats`: batched stats queries and record normalization
//! - `retry`: error classification and backoff
//! - `transport`: endpoint seam, JSON-lines codec, in-memory endpoint
//! - `service`: lifecycle and health around the above
//! - `config`: client configuration from env or file
//!
//! With `tls` feature (default):
//! - `transport::TlsTransport`: JSON-lines RPC over `native-tls`

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod object;
pub mod retry;
pub mod service;
pub mod session;
pub mod stats;
pub mod transport;

pub use config::ClientConfig;
pub use error::{PerfError, StatsError};
pub use object::{EntityKind, ObjectKey};
pub use service::{Health, Lifecycle, PerfService};
pub use stats::{MetricRecord, QueryMode};
