//! Process-wide access-log sink: one JSON object per request, newline
//! terminated, written with a single atomic append per entry (spec section
//! 5, "Access log: a single process-wide sink ... atomic append per entry").

use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::error;

/// Fields required by spec section 6, plus the response-metadata bag
/// (spec section 3) flattened into `metadata`.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry {
    pub timestamp: String,
    pub client_ip: String,
    pub remote_user: String,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub status: u16,
    pub body_bytes_sent: u64,
    pub request_id: String,
    pub request_time: f64,
    pub referer: String,
    pub user_agent: String,
    pub fly_request_id: String,
    #[serde(flatten)]
    pub metadata: ResponseMetadata,
}

/// The "response metadata bag" of spec section 3: filled at exactly one
/// point per terminal action, consumed by the access logger.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ResponseMetadata {
    pub response_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResponseMetadata {
    pub fn new(response_type: &'static str) -> Self {
        Self {
            response_type,
            ..Default::default()
        }
    }
}

/// Builder collected across a request's lifetime in the pipeline, turned
/// into an `AccessLogEntry` at `Finish`.
#[derive(Debug, Default)]
pub struct AccessLogFields {
    pub client_ip: String,
    pub remote_user: Option<String>,
    pub method: String,
    pub uri: String,
    pub protocol: String,
    pub request_id: String,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub fly_request_id: Option<String>,
    pub extra: HashMap<String, String>,
}

pub trait AccessLogSink: Send + Sync {
    fn write(&self, entry: &AccessLogEntry);
}

/// Default sink: newline-delimited JSON to an arbitrary `Write`r (process
/// stdout in production, an in-memory buffer in tests).
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }
}

impl<W: Write + Send> AccessLogSink for JsonLinesSink<W> {
    fn write(&self, entry: &AccessLogEntry) {
        match serde_json::to_string(entry) {
            Ok(line) => {
                let mut w = self.writer.lock().unwrap();
                if let Err(e) = writeln!(w, "{line}") {
                    error!("failed to write access log entry: {}", e);
                }
            }
            Err(e) => error!("failed to serialize access log entry: {}", e),
        }
    }
}

pub fn record(
    sink: &dyn AccessLogSink,
    fields: AccessLogFields,
    status: u16,
    body_bytes_sent: u64,
    request_time: Duration,
    metadata: ResponseMetadata,
) {
    let entry = AccessLogEntry {
        timestamp: Utc::now().to_rfc3339(),
        client_ip: fields.client_ip,
        remote_user: fields.remote_user.unwrap_or_else(|| "-".to_string()),
        method: fields.method,
        uri: fields.uri,
        protocol: fields.protocol,
        status,
        body_bytes_sent,
        request_id: fields.request_id,
        request_time: (request_time.as_secs_f64() * 1000.0).round() / 1000.0,
        referer: fields.referer.unwrap_or_else(|| "-".to_string()),
        user_agent: fields.user_agent.unwrap_or_else(|| "-".to_string()),
        fly_request_id: fields.fly_request_id.unwrap_or_else(|| "-".to_string()),
        metadata,
    };
    sink.write(&entry);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Default)]
    struct CapturingWriter(Vec<u8>);
    impl Write for CapturingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn entry_serializes_required_fields_and_metadata() {
        let sink = JsonLinesSink::new(CapturingWriter::default());
        let fields = AccessLogFields {
            client_ip: "1.2.3.4".into(),
            method: "GET".into(),
            uri: "/showcase/t1/".into(),
            protocol: "HTTP/1.1".into(),
            request_id: "req-1".into(),
            ..Default::default()
        };
        let mut metadata = ResponseMetadata::new("proxy");
        metadata.tenant = Some("t1".into());
        record(&sink, fields, 200, 42, Duration::from_millis(1234), metadata);

        let written = sink.writer.lock().unwrap().0.clone();
        let line = String::from_utf8(written).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line.trim()) .unwrap();
        assert_eq!(parsed["status"], 200);
        assert_eq!(parsed["request_id"], "req-1");
        assert_eq!(parsed["remote_user"], "-");
        assert_eq!(parsed["response_type"], "proxy");
        assert_eq!(parsed["tenant"], "t1");
        assert_eq!(parsed["request_time"], 1.234);
    }

    #[test]
    fn sink_is_shareable_across_threads() {
        let sink: Arc<dyn AccessLogSink> = Arc::new(JsonLinesSink::new(CapturingWriter::default()));
        let fields = AccessLogFields {
            client_ip: "1.2.3.4".into(),
            method: "GET".into(),
            uri: "/up".into(),
            protocol: "HTTP/1.1".into(),
            request_id: "req-2".into(),
            ..Default::default()
        };
        record(&*sink, fields, 200, 2, Duration::from_millis(1), ResponseMetadata::new("static"));
    }
}
