//! JSON-lines framing for the management endpoint protocol.
//!
//! Each request and each response is a single JSON document followed by
//! `\n`. Requests are tagged by `op`; responses are either
//! `{"ok": <payload>}` or `{"error": {"kind": "...", "message": "..."}}`.

use std::io::{self, BufRead, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{PerfQuery, SessionToken};
use crate::error::PerfError;

/// Upper bound for one response line (16 MiB).
pub const MAX_LINE_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request<'a> {
    Login {
        username: &'a str,
        password: &'a str,
    },
    Logout {
        session: &'a SessionToken,
    },
    QueryCounters {
        session: &'a SessionToken,
    },
    QueryPerf {
        session: &'a SessionToken,
        #[serde(flatten)]
        query: &'a PerfQuery,
    },
}

impl Request<'_> {
    /// Operation name as sent on the wire, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Login { .. } => "login",
            Request::Logout { .. } => "logout",
            Request::QueryCounters { .. } => "query_counters",
            Request::QueryPerf { .. } => "query_perf",
        }
    }
}

/// Payload of a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginReply {
    pub session: SessionToken,
}

/// Error reported by the endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WireError {
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl WireError {
    /// Maps the endpoint's error kind to the client taxonomy.
    ///
    /// `throttled` and `busy` are transient and map to `Connectivity`.
    /// Unknown kinds are treated as `Protocol`.
    pub fn into_error(self) -> PerfError {
        let detail = if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        };
        match self.kind.as_str() {
            "not_authenticated" => PerfError::SessionExpired(detail),
            "invalid_login" => PerfError::Authentication(detail),
            "invalid_object" | "invalid_argument" => PerfError::InvalidArgument(detail),
            "throttled" | "busy" => PerfError::Connectivity(detail),
            _ => PerfError::Protocol(detail),
        }
    }
}

/// One decoded response line.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response<T> {
    Ok(T),
    Error(WireError),
}

impl<T> Response<T> {
    pub fn into_result(self) -> Result<T, PerfError> {
        match self {
            Response::Ok(value) => Ok(value),
            Response::Error(e) => Err(e.into_error()),
        }
    }
}

/// Encodes `request` as one `\n`-terminated line.
pub fn encode_request(request: &Request<'_>) -> Result<Vec<u8>, PerfError> {
    let mut line = serde_json::to_vec(request)
        .map_err(|e| PerfError::Protocol(format!("encode {}: {}", request.op(), e)))?;
    line.push(b'\n');
    Ok(line)
}

/// Writes `request` as one line and flushes.
pub fn write_request<W: Write>(writer: &mut W, request: &Request<'_>) -> Result<(), PerfError> {
    let line = encode_request(request)?;
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}

/// Reads one raw line. `None` means the peer closed the stream.
///
/// A line longer than [`MAX_LINE_BYTES`] is `InvalidData`.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut line = String::new();
    let n = reader.take(MAX_LINE_BYTES).read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') && n as u64 >= MAX_LINE_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response exceeds {} bytes", MAX_LINE_BYTES),
        ));
    }
    Ok(Some(line))
}

/// Decodes one response line.
pub fn decode_response<T: DeserializeOwned>(line: &str) -> Result<Response<T>, PerfError> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| PerfError::Protocol(format!("decode response: {}", e)))
}

/// Reads one response line.
///
/// The outer error is a transport or framing failure, after which the
/// connection must not be reused. An endpoint-reported error is returned
/// as `Response::Error`.
pub fn read_response<R, T>(reader: &mut R) -> Result<Response<T>, PerfError>
where
    R: BufRead,
    T: DeserializeOwned,
{
    match read_frame(reader)? {
        Some(line) => decode_response(&line),
        None => Err(PerfError::Connectivity(
            "connection closed by endpoint".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MetricDescriptor;
    use crate::object::ObjectKey;
    use crate::transport::RawSample;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    fn encode(request: &Request<'_>) -> serde_json::Value {
        let mut buf = Vec::new();
        write_request(&mut buf, request).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
        serde_json::from_slice(&buf).unwrap()
    }

    #[test]
    fn login_request_shape() {
        let v = encode(&Request::Login {
            username: "monitor",
            password: "pw",
        });
        assert_eq!(
            v,
            serde_json::json!({"op": "login", "username": "monitor", "password": "pw"})
        );
    }

    #[test]
    fn perf_query_is_flattened() {
        let session = SessionToken::new("abc");
        let end = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
        let query = PerfQuery {
            entity: ObjectKey::vm("vm-49").unwrap(),
            counter_ids: vec![1, 2],
            start: None,
            end,
            interval_secs: 20,
            max_samples: Some(1),
        };
        let v = encode(&Request::QueryPerf {
            session: &session,
            query: &query,
        });

        assert_eq!(v["op"], "query_perf");
        assert_eq!(v["session"], "abc");
        assert_eq!(v["entity"], serde_json::json!({"type": "VirtualMachine", "id": "vm-49"}));
        assert_eq!(v["counter_ids"], serde_json::json!([1, 2]));
        assert_eq!(v["max_samples"], 1);
        assert!(v.get("start").is_none());
    }

    #[test]
    fn ok_payloads_decode() {
        let input = concat!(
            r#"{"ok":{"session":"tok-1"}}"#,
            "\n",
            r#"{"ok":[{"counter_id":1,"timestamp":"2026-01-15T12:00:00Z","value":42.0}]}"#,
            "\n",
        );
        let mut reader = Cursor::new(input.as_bytes());

        let login: LoginReply = read_response(&mut reader).unwrap().into_result().unwrap();
        assert_eq!(login.session.as_str(), "tok-1");

        let samples: Vec<RawSample> = read_response(&mut reader).unwrap().into_result().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].instance, "");
        assert_eq!(samples[0].value, 42.0);
    }

    #[test]
    fn descriptors_decode_with_defaults() {
        let input = r#"{"ok":[{"id":6,"group":"cpu","name":"cpu.usage","unit":"%","applies_to":["vm","host"]}]}"#;
        let descriptors: Vec<MetricDescriptor> = read_response(&mut Cursor::new(input))
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(descriptors[0].level, 1);
        assert_eq!(descriptors[0].applies_to.len(), 2);
    }

    #[test]
    fn endpoint_errors_map_to_taxonomy() {
        let cases = [
            ("not_authenticated", "session_expired"),
            ("invalid_login", "authentication"),
            ("invalid_object", "invalid_argument"),
            ("invalid_argument", "invalid_argument"),
            ("throttled", "connectivity"),
            ("busy", "connectivity"),
            ("internal", "protocol"),
            ("something_new", "protocol"),
        ];
        for (wire, expected) in cases {
            let line = format!(r#"{{"error":{{"kind":"{}","message":"m"}}}}"#, wire);
            let err = read_response::<_, ()>(&mut Cursor::new(line))
                .unwrap()
                .into_result()
                .unwrap_err();
            assert_eq!(err.kind(), expected, "wire kind {}", wire);
        }
    }

    #[test]
    fn closed_stream_is_connectivity() {
        let err = read_response::<_, ()>(&mut Cursor::new("")).unwrap_err();
        assert!(matches!(err, PerfError::Connectivity(_)));
    }

    #[test]
    fn garbage_is_protocol_error() {
        let err = read_response::<_, ()>(&mut Cursor::new("<html>\n")).unwrap_err();
        assert!(matches!(err, PerfError::Protocol(_)));
    }

    #[test]
    fn oversized_line_is_protocol_error() {
        let line = vec![b'x'; MAX_LINE_BYTES as usize + 1];
        let err = read_response::<_, ()>(&mut Cursor::new(line)).unwrap_err();
        assert!(matches!(err, PerfError::Protocol(_)), "{:?}", err);
    }

    #[test]
    fn frames_split_on_newline_and_report_eof() {
        let mut reader = Cursor::new("{\"ok\":1}\n{\"ok\":2}\n");
        assert_eq!(read_frame(&mut reader).unwrap().as_deref(), Some("{\"ok\":1}\n"));
        let second: u32 = decode_response(&read_frame(&mut reader).unwrap().unwrap())
            .unwrap()
            .into_result()
            .unwrap();
        assert_eq!(second, 2);
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn null_payload_is_unit() {
        let r = read_response::<_, ()>(&mut Cursor::new("{\"ok\":null}\n")).unwrap();
        assert!(r.into_result().is_ok());
    }
}
