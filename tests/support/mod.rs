//! Shared test utilities: a scriptable mock Splunk HEC endpoint.
//!
//! The mock records every request (path, headers, raw body) and answers
//! with scripted status codes: `push_statuses` queues one-shot responses,
//! after which `set_default_status` applies. Bodies are available raw and
//! gzip-decoded so gzip forwarding can be asserted end to end.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use zpa_relay::config::RelayConfig;
use zpa_relay::supervisor::Supervisor;

/// Write `yaml` into `dir`, build the supervisor, and start it.
///
/// Returns the running supervisor and the first listener's bound address.
pub async fn start_relay(dir: &Path, yaml: &str) -> (Supervisor, SocketAddr) {
    let config_path = dir.join("relay.yaml");
    std::fs::write(&config_path, yaml).expect("write config");
    let config = RelayConfig::load(&config_path).expect("valid config");
    let mut supervisor = Supervisor::build(config_path, config)
        .await
        .expect("build supervisor");
    supervisor.start().await.expect("start supervisor");
    let addr = supervisor.listener_addrs()[0];
    (supervisor, addr)
}

/// One recorded HTTP request.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Body after undoing any Content-Encoding: gzip.
    pub fn decoded_body(&self) -> Vec<u8> {
        if self.header("content-encoding") == Some("gzip") {
            use flate2::read::GzDecoder;
            use std::io::Read;
            let mut out = Vec::new();
            GzDecoder::new(self.body.as_slice())
                .read_to_end(&mut out)
                .expect("mock received invalid gzip body");
            out
        } else {
            self.body.clone()
        }
    }

    /// Decoded body split into lines.
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8(self.decoded_body())
            .expect("mock received non-UTF-8 body")
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

struct MockState {
    scripted: Mutex<VecDeque<u16>>,
    default_status: AtomicU16,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A minimal scriptable HEC endpoint bound to a random local port.
pub struct MockHec {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockHec {
    pub async fn start() -> MockHec {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock HEC");
        let addr = listener.local_addr().expect("mock HEC local addr");
        let state = Arc::new(MockState {
            scripted: Mutex::new(VecDeque::new()),
            default_status: AtomicU16::new(200),
            requests: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let state = accept_state.clone();
                        tokio::spawn(serve(stream, state));
                    }
                    Err(_) => break,
                }
            }
        });

        MockHec { addr, state }
    }

    /// Collector URL in the raw-endpoint form the relay is configured with.
    pub fn url(&self) -> String {
        format!("http://{}/services/collector/raw", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Status for requests once the scripted queue is drained.
    pub fn set_default_status(&self, status: u16) {
        self.state.default_status.store(status, Ordering::SeqCst);
    }

    /// Queue one-shot statuses consumed in order before the default applies.
    pub fn push_statuses(&self, statuses: &[u16]) {
        let mut scripted = self.state.scripted.lock().unwrap();
        scripted.extend(statuses.iter().copied());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Recorded POSTs to the collector endpoint (health probes excluded).
    pub fn event_posts(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "POST" && r.path.starts_with("/services/collector"))
            .collect()
    }

    /// Total record lines across all successful-or-not event POST bodies.
    pub fn total_lines(&self) -> usize {
        self.event_posts().iter().map(|r| r.lines().len()).sum()
    }

    /// Poll until `pred` holds or `timeout` elapses; returns whether it held.
    pub async fn wait_until(&self, timeout: Duration, pred: impl Fn(&MockHec) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

/// Serve one (possibly keep-alive) client connection.
async fn serve(mut stream: TcpStream, state: Arc<MockState>) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        // Accumulate until a full head (terminated by CRLFCRLF) is present.
        let head_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };

        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        let mut lines = head.lines();
        let request_line = match lines.next() {
            Some(l) => l.to_owned(),
            None => return,
        };
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_owned();
        let path = parts.next().unwrap_or("/").to_owned();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_lowercase(), value.trim().to_owned());
            }
        }
        let content_length: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let body_start = head_end + 4;
        while buf.len() < body_start + content_length {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        let body = buf[body_start..body_start + content_length].to_vec();
        buf.drain(..body_start + content_length);

        state.requests.lock().unwrap().push(RecordedRequest {
            method,
            path,
            headers,
            body,
        });

        let status = state
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| state.default_status.load(Ordering::SeqCst));
        let response_body = r#"{"text":"Success","code":0}"#;
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            reason(status),
            response_body.len(),
            response_body,
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
