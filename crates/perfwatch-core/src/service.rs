//! Service wrapper: session, catalog, cache and engine behind a
//! `start`/`stop` lifecycle.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::catalog::MetricCatalog;
use crate::config::ClientConfig;
use crate::error::{PerfError, StatsError};
use crate::object::{EntityKind, ObjectKey};
use crate::retry::RetryPolicy;
use crate::session::ConnectionManager;
use crate::stats::{MetricRecord, QueryOptions, StatsEngine};
use crate::transport::PerfTransport;
#[cfg(feature = "tls")]
use crate::transport::TlsTransport;

/// Start/stop contract for long-lived components.
pub trait Lifecycle {
    fn start(&self) -> Result<(), PerfError>;
    fn stop(&self);
}

/// Readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub session_active: bool,
    pub catalog_ready: bool,
}

impl Health {
    pub fn is_ready(&self) -> bool {
        self.session_active && self.catalog_ready
    }
}

pub struct PerfService<T: PerfTransport> {
    engine: StatsEngine<T>,
}

#[cfg(feature = "tls")]
impl PerfService<TlsTransport> {
    /// Validates `config` and builds a service talking TLS to its endpoint.
    pub fn from_config(config: &ClientConfig) -> Result<Self, PerfError> {
        let transport = TlsTransport::from_config(config)?;
        Ok(Self::with_transport(transport, config))
    }
}

impl<T: PerfTransport> PerfService<T> {
    pub fn with_transport(transport: T, config: &ClientConfig) -> Self {
        let conn = Arc::new(ConnectionManager::new(
            transport,
            config.credentials.clone(),
        ));
        let engine = StatsEngine::new(
            conn,
            MetricCatalog::new(config.query.max_level),
            RetryPolicy::from_config(&config.retry),
            QueryOptions::from_config(&config.query),
        );
        Self { engine }
    }

    pub fn engine(&self) -> &StatsEngine<T> {
        &self.engine
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        self.engine.connection()
    }

    pub fn health(&self) -> Health {
        Health {
            session_active: self.engine.connection().is_connected(),
            catalog_ready: self.engine.catalog().is_resolved(),
        }
    }

    pub fn retrieve_metrics(
        &self,
        key: &ObjectKey,
        kind: EntityKind,
    ) -> Result<Vec<MetricRecord>, StatsError> {
        self.engine.retrieve_metrics(key, kind)
    }

    pub fn retrieve_vm_metrics(&self, id: &str) -> Result<Vec<MetricRecord>, StatsError> {
        self.engine.retrieve_vm_metrics(id)
    }

    pub fn retrieve_host_metrics(&self, id: &str) -> Result<Vec<MetricRecord>, StatsError> {
        self.engine.retrieve_host_metrics(id)
    }
}

impl<T: PerfTransport> Lifecycle for PerfService<T> {
    /// Opens the session and resolves the counter catalog.
    fn start(&self) -> Result<(), PerfError> {
        self.engine.connection().connect()?;
        let counters = self.engine.resolve_catalog()?;
        info!(counters = counters.len(), "performance service started");
        Ok(())
    }

    /// Drops cached state and closes the session.
    fn stop(&self) {
        self.engine.reset();
        self.engine.connection().disconnect();
        info!("performance service stopped");
    }
}
