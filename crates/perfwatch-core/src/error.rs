//! Error types for telemetry acquisition.

use crate::object::ObjectKey;

/// Error type for remote performance-telemetry operations.
///
/// Payloads are plain strings so errors can be cloned and handed to every
/// caller coalesced into a single remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PerfError {
    /// Credentials rejected by the endpoint.
    Authentication(String),
    /// Endpoint unreachable, TLS failure, or network fault mid-call.
    Connectivity(String),
    /// Handshake or request exceeded the configured timeout.
    Timeout(String),
    /// Session invalidated while the call was in flight.
    SessionExpired(String),
    /// Malformed key, kind mismatch or an object the endpoint does not know.
    InvalidArgument(String),
    /// Counter catalog used before a successful resolution.
    NotResolved,
    /// No session: never connected, or disconnected explicitly.
    NotConnected,
    /// Unparseable response or endpoint-side internal error.
    Protocol(String),
    /// Invalid client configuration.
    Config(String),
}

impl PerfError {
    /// Returns a short, stable name of the error kind for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PerfError::Authentication(_) => "authentication",
            PerfError::Connectivity(_) => "connectivity",
            PerfError::Timeout(_) => "timeout",
            PerfError::SessionExpired(_) => "session_expired",
            PerfError::InvalidArgument(_) => "invalid_argument",
            PerfError::NotResolved => "not_resolved",
            PerfError::NotConnected => "not_connected",
            PerfError::Protocol(_) => "protocol",
            PerfError::Config(_) => "config",
        }
    }
}

impl std::fmt::Display for PerfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerfError::Authentication(msg) => {
                write!(f, "authentication failed: {} (check credentials)", msg)
            }
            PerfError::Connectivity(msg) => write!(f, "connectivity error: {}", msg),
            PerfError::Timeout(msg) => write!(f, "timed out: {}", msg),
            PerfError::SessionExpired(msg) => write!(f, "session expired: {}", msg),
            PerfError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            PerfError::NotResolved => write!(f, "metric catalog not resolved"),
            PerfError::NotConnected => write!(f, "not connected"),
            PerfError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            PerfError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for PerfError {}

impl From<std::io::Error> for PerfError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => PerfError::Timeout(e.to_string()),
            ErrorKind::InvalidData => PerfError::Protocol(e.to_string()),
            _ => PerfError::Connectivity(e.to_string()),
        }
    }
}

/// Failure of a stats retrieval, with the object and operation it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsError {
    pub key: ObjectKey,
    pub operation: &'static str,
    pub source: PerfError,
}

impl StatsError {
    pub(crate) fn new(key: &ObjectKey, operation: &'static str, source: PerfError) -> Self {
        Self {
            key: key.clone(),
            operation,
            source,
        }
    }

    /// Returns the underlying error.
    pub fn error(&self) -> &PerfError {
        &self.source
    }
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {}: {}", self.operation, self.key, self.source)
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_timeouts_map_to_timeout() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        assert_eq!(PerfError::from(e).kind(), "timeout");

        let e = std::io::Error::new(std::io::ErrorKind::WouldBlock, "resource unavailable");
        assert_eq!(PerfError::from(e).kind(), "timeout");
    }

    #[test]
    fn io_refused_maps_to_connectivity() {
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(PerfError::from(e).kind(), "connectivity");
    }

    #[test]
    fn stats_error_display_includes_context() {
        let key = ObjectKey::new("VirtualMachine", "vm-49").unwrap();
        let err = StatsError::new(&key, "query_perf", PerfError::Timeout("5s".into()));
        assert_eq!(
            err.to_string(),
            "query_perf for VirtualMachine:vm-49: timed out: 5s"
        );
    }
}
