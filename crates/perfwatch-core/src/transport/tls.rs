//! JSON-lines RPC over TLS.

use std::io::{BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use native_tls::{HandshakeError, TlsConnector, TlsStream};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::codec::{self, LoginReply, Request};
use super::{PerfQuery, PerfTransport, RawSample, SessionToken};
use crate::catalog::MetricDescriptor;
use crate::config::{ClientConfig, Credentials, Endpoint, TlsPolicy};
use crate::error::PerfError;

/// Idle connections kept for reuse.
const MAX_IDLE: usize = 4;

type Connection = BufReader<TlsStream<TcpStream>>;

pub struct TlsTransport {
    endpoint: Endpoint,
    connector: TlsConnector,
    timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl TlsTransport {
    pub fn new(endpoint: Endpoint, tls: TlsPolicy, timeout: Duration) -> Result<Self, PerfError> {
        let mut builder = TlsConnector::builder();
        if tls == TlsPolicy::Bypass {
            warn!(endpoint = %endpoint, "TLS certificate validation disabled");
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let connector = builder
            .build()
            .map_err(|e| PerfError::Connectivity(format!("TLS setup: {}", e)))?;
        Ok(Self {
            endpoint,
            connector,
            timeout,
            idle: Mutex::new(Vec::new()),
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, PerfError> {
        config.validate()?;
        Self::new(
            Endpoint::parse(&config.endpoint)?,
            config.tls,
            config.timeout(),
        )
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn open(&self) -> Result<Connection, PerfError> {
        let addrs: Vec<SocketAddr> = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|e| PerfError::Connectivity(format!("resolve {}: {}", self.endpoint, e)))?
            .collect();

        let mut last_error = PerfError::Connectivity(format!("no address for {}", self.endpoint));
        let mut tcp = None;
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "connect failed");
                    last_error = e.into();
                }
            }
        }
        let Some(tcp) = tcp else {
            return Err(last_error);
        };
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;
        tcp.set_nodelay(true)?;

        let stream = self
            .connector
            .connect(&self.endpoint.host, tcp)
            .map_err(|e| format_handshake_error(&self.endpoint, e))?;
        debug!(endpoint = %self.endpoint, "TLS connection established");
        Ok(BufReader::new(stream))
    }

    fn checkout(&self) -> Option<Connection> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).pop()
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }

    /// Sends one request and reads its response.
    ///
    /// A pooled connection the endpoint has already closed is dropped and
    /// the request is sent once more on a fresh connection. Any other
    /// failure, a timeout included, is returned without resending.
    fn call<T: DeserializeOwned>(&self, request: &Request<'_>) -> Result<T, PerfError> {
        let line = codec::encode_request(request)?;

        if let Some(mut conn) = self.checkout() {
            match exchange(&mut conn, &line)? {
                Outcome::Reply(response) => {
                    self.checkin(conn);
                    return response.into_result();
                }
                Outcome::Stale(e) => {
                    debug!(op = request.op(), error = %e, "pooled connection closed, reopening");
                }
            }
        }

        let mut conn = self.open()?;
        match exchange(&mut conn, &line)? {
            Outcome::Reply(response) => {
                self.checkin(conn);
                response.into_result()
            }
            Outcome::Stale(e) => Err(e),
        }
    }
}

/// Result of one request/response exchange on a connection.
enum Outcome<T> {
    Reply(codec::Response<T>),
    /// The peer had closed the connection before the request was answered.
    Stale(PerfError),
}

fn exchange<T: DeserializeOwned>(
    conn: &mut Connection,
    line: &[u8],
) -> Result<Outcome<T>, PerfError> {
    let stream = conn.get_mut();
    if let Err(e) = stream.write_all(line).and_then(|()| stream.flush()) {
        return match e.kind() {
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Ok(Outcome::Stale(e.into()))
            }
            _ => Err(e.into()),
        };
    }
    match codec::read_frame(conn)? {
        Some(frame) => Ok(Outcome::Reply(codec::decode_response(&frame)?)),
        None => Ok(Outcome::Stale(PerfError::Connectivity(
            "connection closed by endpoint".to_string(),
        ))),
    }
}

fn format_handshake_error(endpoint: &Endpoint, e: HandshakeError<TcpStream>) -> PerfError {
    match e {
        HandshakeError::Failure(e) => {
            PerfError::Connectivity(format!("TLS handshake with {}: {}", endpoint, e))
        }
        HandshakeError::WouldBlock(_) => {
            PerfError::Timeout(format!("TLS handshake with {}", endpoint))
        }
    }
}

impl PerfTransport for TlsTransport {
    fn login(&self, credentials: &Credentials) -> Result<SessionToken, PerfError> {
        let reply: LoginReply = self.call(&Request::Login {
            username: &credentials.username,
            password: &credentials.password,
        })?;
        Ok(reply.session)
    }

    fn logout(&self, session: &SessionToken) {
        if let Err(e) = self.call::<()>(&Request::Logout { session }) {
            debug!(error = %e, "logout failed");
        }
    }

    fn query_counters(&self, session: &SessionToken) -> Result<Vec<MetricDescriptor>, PerfError> {
        self.call(&Request::QueryCounters { session })
    }

    fn query_perf(
        &self,
        session: &SessionToken,
        query: &PerfQuery,
    ) -> Result<Vec<RawSample>, PerfError> {
        self.call(&Request::QueryPerf { session, query })
    }
}
