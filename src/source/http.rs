//! HTTP implementation of the log source and log stream.
//!
//! Endpoints, relative to the configured base URL:
//!
//! ```text
//! GET /executions/{id}              → { id, status, analysis? }
//! GET /executions/{id}/logs         → { output }
//! GET /executions/{id}/artifacts    → [ { name, url?, size? } ] | { artifacts: [...] }
//! GET /executions/{id}/logs/stream  → text/event-stream, data: { chunk }, event: end
//! ```

use std::io::{BufRead, BufReader};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{CancelToken, IncrementHandler, LogSource, LogStream, Subscription, gated};
use crate::error::{FetchError, FetchResult};
use crate::execution::{Artifact, ExecutionId, ExecutionRecord};

/// Connection settings shared by the source and the stream.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Deserialize)]
struct LogsBody {
    output: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArtifactsBody {
    List(Vec<Artifact>),
    Wrapped { artifacts: Vec<Artifact> },
}

impl ArtifactsBody {
    fn into_vec(self) -> Vec<Artifact> {
        match self {
            ArtifactsBody::List(artifacts) | ArtifactsBody::Wrapped { artifacts } => artifacts,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChunkBody {
    chunk: String,
}

fn execution_url(base_url: &str, execution_id: &ExecutionId, suffix: &str) -> String {
    format!(
        "{}/executions/{}{}",
        base_url.trim_end_matches('/'),
        execution_id.percent_encoded(),
        suffix
    )
}

fn map_error(error: ureq::Error) -> FetchError {
    match error {
        ureq::Error::Status(status @ (401 | 403), _) => FetchError::Auth { status },
        ureq::Error::Status(status, _) => FetchError::Network(format!("HTTP {status}")),
        ureq::Error::Transport(transport) => FetchError::Network(transport.to_string()),
    }
}

fn authorized(request: ureq::Request, token: Option<&str>) -> ureq::Request {
    match token {
        Some(token) => request.set("Authorization", &format!("Bearer {token}")),
        None => request,
    }
}

/// Execution API client for point-in-time reads.
pub struct HttpLogSource {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
}

impl HttpLogSource {
    pub fn new(settings: &HttpSettings) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(settings.timeout).build();
        Self {
            agent,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> FetchResult<T> {
        debug!(url = %url, "GET");
        let response = authorized(self.agent.get(url), self.token.as_deref())
            .call()
            .map_err(map_error)?;
        response
            .into_json::<T>()
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

impl LogSource for HttpLogSource {
    fn fetch_historical(
        &self,
        execution_id: &ExecutionId,
        cancel: &CancelToken,
    ) -> FetchResult<String> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let url = execution_url(&self.base_url, execution_id, "/logs");
        let body: LogsBody = self.get_json(&url)?;
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        Ok(body.output)
    }

    fn list_artifacts(&self, execution_id: &ExecutionId) -> FetchResult<Vec<Artifact>> {
        let url = execution_url(&self.base_url, execution_id, "/artifacts");
        let body: ArtifactsBody = self.get_json(&url)?;
        Ok(body.into_vec())
    }

    fn fetch_execution(&self, execution_id: &ExecutionId) -> FetchResult<ExecutionRecord> {
        let url = execution_url(&self.base_url, execution_id, "");
        self.get_json(&url)
    }
}

/// How a single stream connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Server sent `event: end`; the execution produces no more output.
    Finished,
    /// Connection closed without an end marker.
    Disconnected,
    /// The subscription was cancelled locally.
    Cancelled,
}

/// Read a server-sent event stream, handing each decoded chunk to
/// `on_increment`.
pub fn read_event_stream<R: BufRead>(
    reader: R,
    cancel: &CancelToken,
    mut on_increment: impl FnMut(String),
) -> std::io::Result<StreamEnd> {
    let mut event = String::new();
    let mut data: Vec<String> = Vec::new();

    for line in reader.lines() {
        if cancel.is_cancelled() {
            return Ok(StreamEnd::Cancelled);
        }
        let line = line?;
        let line = line.strip_suffix('\r').unwrap_or(&line);

        if line.is_empty() {
            if event == "end" {
                return Ok(StreamEnd::Finished);
            }
            if !data.is_empty() {
                let payload = data.join("\n");
                match serde_json::from_str::<ChunkBody>(&payload) {
                    Ok(body) => on_increment(body.chunk),
                    Err(e) => warn!(error = %e, "skipping undecodable stream event"),
                }
            }
            event.clear();
            data.clear();
            continue;
        }
        if line.starts_with(':') {
            continue; // keep-alive comment
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = value.to_string(),
            "data" => data.push(value.to_string()),
            _ => {}
        }
    }

    if event == "end" {
        return Ok(StreamEnd::Finished);
    }
    Ok(StreamEnd::Disconnected)
}

/// Push-channel client over server-sent events.
pub struct HttpLogStream {
    agent: ureq::Agent,
    base_url: String,
    token: Option<String>,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
}

impl HttpLogStream {
    pub fn new(settings: &HttpSettings) -> Self {
        // A stream connection stays open for the life of the run, so only
        // connecting is bounded.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.timeout)
            .build();
        Self {
            agent,
            base_url: settings.base_url.clone(),
            token: settings.token.clone(),
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_backoff: settings.reconnect_backoff,
        }
    }
}

struct StreamWorker {
    agent: ureq::Agent,
    url: String,
    token: Option<String>,
    execution_id: ExecutionId,
    reconnect_attempts: u32,
    reconnect_backoff: Duration,
    cancel: CancelToken,
}

impl StreamWorker {
    /// Connect, read, and reconnect until the stream finishes or is
    /// cancelled. Consecutive connections that deliver no chunk count
    /// against `reconnect_attempts`, whether they error or close cleanly.
    fn run(self, mut on_increment: IncrementHandler) {
        let mut failures = 0u32;
        while !self.cancel.is_cancelled() {
            let request = authorized(self.agent.get(&self.url), self.token.as_deref())
                .set("Accept", "text/event-stream");
            let mut delivered = 0usize;
            let outcome = match request.call() {
                Ok(response) => {
                    info!(execution_id = %self.execution_id, "log stream connected");
                    let reader = BufReader::new(response.into_reader());
                    read_event_stream(reader, &self.cancel, |chunk| {
                        delivered += 1;
                        on_increment(chunk);
                    })
                    .map_err(|e| FetchError::Network(e.to_string()))
                }
                Err(e) => Err(map_error(e)),
            };
            if delivered > 0 {
                failures = 0;
            }

            let error = match outcome {
                Ok(StreamEnd::Finished) => {
                    info!(execution_id = %self.execution_id, "log stream finished");
                    return;
                }
                Ok(StreamEnd::Cancelled) => return,
                Ok(StreamEnd::Disconnected) if delivered > 0 => {
                    debug!(execution_id = %self.execution_id, "log stream disconnected");
                    None
                }
                Ok(StreamEnd::Disconnected) => Some(FetchError::Network(
                    "stream closed without output".to_string(),
                )),
                Err(e) if e.is_auth() => {
                    warn!(execution_id = %self.execution_id, error = %e, "log stream rejected");
                    return;
                }
                Err(e) => Some(e),
            };

            if let Some(e) = error {
                failures += 1;
                warn!(
                    execution_id = %self.execution_id,
                    error = %e,
                    attempt = failures,
                    "log stream error"
                );
                if failures > self.reconnect_attempts {
                    warn!(execution_id = %self.execution_id, "log stream giving up");
                    return;
                }
            }

            thread::sleep(self.reconnect_backoff);
        }
    }
}

impl LogStream for HttpLogStream {
    fn subscribe(
        &self,
        execution_id: &ExecutionId,
        on_increment: IncrementHandler,
    ) -> FetchResult<Subscription> {
        let cancel = CancelToken::new();
        let worker = StreamWorker {
            agent: self.agent.clone(),
            url: execution_url(&self.base_url, execution_id, "/logs/stream"),
            token: self.token.clone(),
            execution_id: execution_id.clone(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: self.reconnect_backoff,
            cancel: cancel.clone(),
        };
        let handler = gated(cancel.clone(), on_increment);
        thread::Builder::new()
            .name(format!("log-stream-{}", execution_id))
            .spawn(move || worker.run(handler))
            .map_err(|e| FetchError::Network(format!("failed to start stream worker: {e}")))?;
        Ok(Subscription::new(execution_id.clone(), cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    fn canned_response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\n\
             Content-Type: {content_type}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn read_request_head(socket: &mut TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&request).to_string()
    }

    /// Serve exactly one canned HTTP response and hand back the request head.
    fn serve_once(status: &str, body: &str) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let response = canned_response(status, "application/json", body);
        let handle = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let request = read_request_head(&mut socket);
            socket.write_all(response.as_bytes()).unwrap();
            request
        });
        (format!("http://{addr}/api"), handle)
    }

    /// Answer every connection with the same event-stream body and count
    /// the connections.
    fn serve_stream_forever(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        thread::spawn(move || {
            for socket in listener.incoming() {
                let Ok(mut socket) = socket else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                read_request_head(&mut socket);
                let response = canned_response("200 OK", "text/event-stream", body);
                let _ = socket.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}/api"), connections)
    }

    fn wait_for(deadline: Duration, done: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    fn settings(base_url: String) -> HttpSettings {
        HttpSettings {
            base_url,
            token: Some("secret".to_string()),
            timeout: Duration::from_secs(5),
            reconnect_attempts: 0,
            reconnect_backoff: Duration::from_millis(10),
        }
    }

    fn collecting_handler() -> (Arc<Mutex<Vec<String>>>, IncrementHandler) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |chunk| sink.lock().unwrap().push(chunk)))
    }

    #[test]
    fn execution_url_encodes_id_segment() {
        let id = ExecutionId::new("run 1/a");
        assert_eq!(
            execution_url("http://x/api/", &id, "/logs"),
            "http://x/api/executions/run%201%2Fa/logs"
        );
    }

    #[test]
    fn fetch_historical_returns_output_and_sends_bearer_token() {
        let (base, server) = serve_once("200 OK", r#"{"output":"line1\n"}"#);
        let source = HttpLogSource::new(&settings(base));
        let text = source
            .fetch_historical(&ExecutionId::new("e1"), &CancelToken::new())
            .unwrap();
        assert_eq!(text, "line1\n");

        let request = server.join().unwrap();
        assert!(request.starts_with("GET /api/executions/e1/logs "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[test]
    fn unauthorized_maps_to_auth_error() {
        let (base, server) = serve_once("401 Unauthorized", "{}");
        let source = HttpLogSource::new(&settings(base));
        let err = source
            .fetch_historical(&ExecutionId::new("e1"), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err, FetchError::Auth { status: 401 });
        server.join().unwrap();
    }

    #[test]
    fn server_error_maps_to_network_error() {
        let (base, server) = serve_once("503 Service Unavailable", "{}");
        let source = HttpLogSource::new(&settings(base));
        let err = source.list_artifacts(&ExecutionId::new("e1")).unwrap_err();
        assert!(matches!(err, FetchError::Network(_)), "got {err:?}");
        server.join().unwrap();
    }

    #[test]
    fn already_cancelled_fetch_does_not_touch_network() {
        let source = HttpLogSource::new(&settings("http://127.0.0.1:9".to_string()));
        let token = CancelToken::new();
        token.cancel();
        let err = source
            .fetch_historical(&ExecutionId::new("e1"), &token)
            .unwrap_err();
        assert_eq!(err, FetchError::Cancelled);
    }

    #[test]
    fn artifacts_accept_wrapped_and_bare_lists() {
        let (base, server) = serve_once("200 OK", r#"{"artifacts":[{"name":"a.png"}]}"#);
        let source = HttpLogSource::new(&settings(base));
        let artifacts = source.list_artifacts(&ExecutionId::new("e1")).unwrap();
        assert_eq!(artifacts.len(), 1);
        server.join().unwrap();

        let (base, server) = serve_once("200 OK", r#"[{"name":"a.png"},{"name":"b.log"}]"#);
        let source = HttpLogSource::new(&settings(base));
        let artifacts = source.list_artifacts(&ExecutionId::new("e1")).unwrap();
        assert_eq!(artifacts[1].name, "b.log");
        server.join().unwrap();
    }

    #[test]
    fn undecodable_body_maps_to_decode_error() {
        let (base, server) = serve_once("200 OK", r#"{"unexpected":true}"#);
        let source = HttpLogSource::new(&settings(base));
        let err = source.fetch_execution(&ExecutionId::new("e1")).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)), "got {err:?}");
        server.join().unwrap();
    }

    #[test]
    fn event_stream_delivers_chunks_until_end() {
        let body = ": keep-alive\n\
                    data: {\"chunk\":\"line1\\n\"}\n\n\
                    data: {\"chunk\":\"line2\\n\"}\r\n\r\n\
                    event: end\n\
                    data: {}\n\n\
                    data: {\"chunk\":\"never\"}\n\n";
        let (seen, mut handler) = collecting_handler();
        let end = read_event_stream(body.as_bytes(), &CancelToken::new(), &mut handler).unwrap();
        assert_eq!(end, StreamEnd::Finished);
        assert_eq!(*seen.lock().unwrap(), vec!["line1\n", "line2\n"]);
    }

    #[test]
    fn event_stream_skips_bad_payloads_and_reports_disconnect() {
        let body = "data: not-json\n\ndata: {\"chunk\":\"ok\"}\n\n";
        let (seen, mut handler) = collecting_handler();
        let end = read_event_stream(body.as_bytes(), &CancelToken::new(), &mut handler).unwrap();
        assert_eq!(end, StreamEnd::Disconnected);
        assert_eq!(*seen.lock().unwrap(), vec!["ok"]);
    }

    #[test]
    fn event_stream_stops_when_cancelled() {
        let body = "data: {\"chunk\":\"a\"}\n\n";
        let (seen, mut handler) = collecting_handler();
        let token = CancelToken::new();
        token.cancel();
        let end = read_event_stream(body.as_bytes(), &token, &mut handler).unwrap();
        assert_eq!(end, StreamEnd::Cancelled);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_disconnects_are_bounded_by_reconnect_attempts() {
        let (base, connections) = serve_stream_forever("");
        let stream = HttpLogStream::new(&HttpSettings {
            reconnect_attempts: 2,
            ..settings(base)
        });
        let (seen, handler) = collecting_handler();
        let subscription = stream.subscribe(&ExecutionId::new("e1"), handler).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            connections.load(Ordering::SeqCst) >= 3
        }));
        thread::sleep(Duration::from_millis(300));
        assert_eq!(connections.load(Ordering::SeqCst), 3);
        assert!(seen.lock().unwrap().is_empty());
        drop(subscription);
    }

    #[test]
    fn disconnect_after_output_reconnects() {
        let (base, connections) = serve_stream_forever("data: {\"chunk\":\"x\"}\n\n");
        let stream = HttpLogStream::new(&settings(base));
        let (seen, handler) = collecting_handler();
        let subscription = stream.subscribe(&ExecutionId::new("e1"), handler).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            connections.load(Ordering::SeqCst) >= 3
        }));
        drop(subscription);
        assert!(seen.lock().unwrap().len() >= 2);
    }
}
