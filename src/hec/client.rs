//! Single-target Splunk HEC client.
//!
//! Delivers record payloads to one HEC endpoint with exponential-backoff
//! retry, optional gzip, and a circuit breaker around the whole
//! send-with-retry call. Exhausted deliveries are written to the listener's
//! dead-letter queue when one is configured.
//!
//! # Batching
//! With batching enabled, `forward` only appends to an in-memory buffer; a
//! single long-lived flush worker drains the buffer when the line or byte
//! threshold trips, when the flush interval elapses after the first append,
//! or on shutdown (final flush). A flushed batch travels through the same
//! circuit-gated retry path as a direct send, so callers never observe a
//! breaker rejection at submission time.
//!
//! # Hot reload
//! `token`, `source_type`, and `gzip` may change at runtime. They are
//! snapshotted at the start of each send-with-retry call: in-flight retries
//! observe new values on their next call, never mid-attempt.
//!
//! # Gzip
//! Payloads are compressed once per delivery and the compressed bytes are
//! reused across retries, keeping retries byte-identical.

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::{HecTargetConfig, RetryConfig};
use crate::hec::HecError;
use crate::metrics::{RelayMetrics, inc};
use crate::storage::DlqWriter;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Fields that may be swapped by a SIGHUP reload.
#[derive(Debug, Clone)]
struct Reloadable {
    token: String,
    source_type: String,
    gzip: bool,
}

enum FlushSignal {
    /// First append into an empty buffer: arm the one-shot flush timer.
    Arm,
    /// A size threshold tripped: flush now.
    Flush,
}

#[derive(Default)]
struct BatchBuf {
    lines: Vec<Vec<u8>>,
    bytes: usize,
}

struct BatchState {
    buf: Mutex<BatchBuf>,
    max_lines: usize,
    max_bytes: usize,
    flush_interval: Duration,
    /// Dropped on shutdown so the worker drains and exits.
    tx: Mutex<Option<mpsc::Sender<FlushSignal>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Client for one HEC endpoint.
pub struct HecClient {
    name: String,
    url: String,
    reloadable: RwLock<Reloadable>,
    http: reqwest::Client,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    batch: Option<BatchState>,
    dlq: Option<Arc<DlqWriter>>,
    metrics: Arc<RelayMetrics>,
}

impl HecClient {
    /// Build a client and, if batching is enabled, spawn its flush worker.
    ///
    /// Must be called from within a tokio runtime when batching is enabled.
    pub fn new(
        cfg: &HecTargetConfig,
        dlq: Option<Arc<DlqWriter>>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Arc<Self>, HecError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.client_timeout)
            .build()
            .map_err(HecError::Client)?;

        let batch = cfg.batch.enabled.then(|| BatchState {
            buf: Mutex::new(BatchBuf::default()),
            max_lines: cfg.batch.max_lines,
            max_bytes: cfg.batch.max_bytes,
            flush_interval: cfg.batch.flush_interval,
            tx: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let client = Arc::new(HecClient {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            reloadable: RwLock::new(Reloadable {
                token: cfg.token.clone(),
                source_type: cfg.source_type.clone(),
                gzip: cfg.gzip,
            }),
            http,
            retry: cfg.retry.clone(),
            breaker: CircuitBreaker::new(cfg.circuit_breaker.clone()),
            batch,
            dlq,
            metrics,
        });

        if let Some(batch) = &client.batch {
            let (tx, rx) = mpsc::channel(16);
            let worker = tokio::spawn(flush_worker(client.clone(), rx));
            *lock(&batch.tx) = Some(tx);
            *lock(&batch.worker) = Some(worker);
        }

        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Submit one record for delivery.
    ///
    /// Direct path: delivers (and retries) inline, returning the terminal
    /// outcome. Batching path: copies the record into the buffer and
    /// returns immediately; delivery outcomes surface at flush time.
    pub async fn forward(&self, conn_id: &str, record: &[u8]) -> Result<(), HecError> {
        match &self.batch {
            None => self.deliver(conn_id, record, 1).await,
            Some(batch) => {
                let signal = {
                    let mut buf = lock(&batch.buf);
                    buf.lines.push(record.to_vec());
                    buf.bytes += record.len();
                    if buf.lines.len() >= batch.max_lines || buf.bytes >= batch.max_bytes {
                        FlushSignal::Flush
                    } else if buf.lines.len() == 1 {
                        FlushSignal::Arm
                    } else {
                        return Ok(());
                    }
                };
                let tx = lock(&batch.tx).clone();
                match tx {
                    // A full channel already has a flush or arm in flight.
                    Some(tx) => {
                        let _ = tx.try_send(signal);
                        Ok(())
                    }
                    None => Err(HecError::ShuttingDown),
                }
            }
        }
    }

    /// Probe the endpoint's health API with the configured token.
    pub async fn health_check(&self) -> Result<(), HecError> {
        let token = self.read_reloadable().token;
        let url = health_url(&self.url);
        let resp = self
            .http
            .get(&url)
            .header("Authorization", format!("Splunk {}", token))
            .send()
            .await
            .map_err(|e| HecError::Request {
                target: self.name.clone(),
                source: e,
            })?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(HecError::InvalidToken(self.name.clone()));
        }
        Err(HecError::Unhealthy {
            target: self.name.clone(),
            status_line: format!(
                "{} {}",
                status.as_str(),
                status.canonical_reason().unwrap_or("")
            )
            .trim_end()
            .to_owned(),
        })
    }

    /// Stop the flush worker (final flush included) within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HecError> {
        let Some(batch) = &self.batch else {
            return Ok(());
        };
        drop(lock(&batch.tx).take());
        let worker = lock(&batch.worker).take();
        if let Some(worker) = worker {
            if tokio::time::timeout(deadline, worker).await.is_err() {
                return Err(HecError::ShutdownTimeout(self.name.clone()));
            }
        }
        Ok(())
    }

    /// Apply the reloadable subset. Read at the start of each delivery.
    pub fn update_config(&self, token: String, source_type: String, gzip: bool) {
        let mut r = self
            .reloadable
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        r.token = token;
        r.source_type = source_type;
        r.gzip = gzip;
    }

    // -----------------------------------------------------------------------
    // Delivery path
    // -----------------------------------------------------------------------

    /// Circuit-gated delivery of one payload carrying `records` records.
    ///
    /// Every terminal failure (exhausted retries or an open breaker) writes
    /// a dead-letter entry when a DLQ is configured.
    async fn deliver(
        &self,
        correlation_id: &str,
        payload: &[u8],
        records: u64,
    ) -> Result<(), HecError> {
        let result = self
            .breaker
            .call(|| self.send_with_retry(correlation_id, payload))
            .await;
        match result {
            Ok(()) => {
                self.metrics
                    .records_forwarded
                    .fetch_add(records, Ordering::Relaxed);
                Ok(())
            }
            Err(BreakerError::Open) => {
                let err = HecError::CircuitOpen(self.name.clone());
                inc(&self.metrics.forward_failures);
                self.dead_letter(correlation_id, &err.to_string(), payload);
                Err(err)
            }
            Err(BreakerError::Inner(err)) => {
                inc(&self.metrics.forward_failures);
                self.dead_letter(correlation_id, &err.to_string(), payload);
                Err(err)
            }
        }
    }

    async fn send_with_retry(&self, correlation_id: &str, payload: &[u8]) -> Result<(), HecError> {
        let Reloadable {
            token,
            source_type,
            gzip,
        } = self.read_reloadable();

        // Compress once; retries reuse the same bytes.
        let body = if gzip {
            gzip_payload(payload)?
        } else {
            payload.to_vec()
        };
        let url = format!("{}?sourcetype={}", self.url, source_type);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let mut req = self
                .http
                .post(&url)
                .header("Authorization", format!("Splunk {}", token))
                .header("Content-Type", "text/plain")
                .header("X-Correlation-ID", correlation_id);
            if gzip {
                req = req.header("Content-Encoding", "gzip");
            }

            let err = match req.body(body.clone()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    // Drain the body so the connection can be reused.
                    let _ = resp.bytes().await;
                    HecError::Status {
                        target: self.name.clone(),
                        status,
                    }
                }
                Err(e) => HecError::Request {
                    target: self.name.clone(),
                    source: e,
                },
            };

            if attempt >= self.retry.max_attempts {
                return Err(err);
            }
            let delay = backoff(&self.retry, attempt - 1);
            debug!(
                target_name = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "HEC send failed, retrying"
            );
            inc(&self.metrics.forward_retries);
            tokio::time::sleep(delay).await;
        }
    }

    fn dead_letter(&self, correlation_id: &str, error: &str, payload: &[u8]) {
        let Some(dlq) = &self.dlq else { return };
        match dlq.write(correlation_id, error, payload) {
            Ok(()) => inc(&self.metrics.dlq_writes),
            Err(e) => {
                error!(target_name = %self.name, error = %e, "writing DLQ entry failed");
            }
        }
    }

    /// Drain and deliver the current batch buffer, if non-empty.
    async fn flush_batch(&self) {
        let Some(batch) = &self.batch else { return };
        let (lines, bytes) = {
            let mut buf = lock(&batch.buf);
            if buf.lines.is_empty() {
                return;
            }
            let lines = std::mem::take(&mut buf.lines);
            let bytes = std::mem::replace(&mut buf.bytes, 0);
            (lines, bytes)
        };

        let mut payload = Vec::with_capacity(bytes + lines.len());
        for (i, line) in lines.iter().enumerate() {
            if i > 0 {
                payload.push(b'\n');
            }
            payload.extend_from_slice(line);
        }

        // The flush has its own correlation id; the batch aggregates
        // records from many connections.
        let flush_id = Uuid::new_v4().to_string();
        if let Err(e) = self.deliver(&flush_id, &payload, lines.len() as u64).await {
            warn!(
                target_name = %self.name,
                lines = lines.len(),
                error = %e,
                "batch flush failed"
            );
        }
    }

    fn read_reloadable(&self) -> Reloadable {
        self.reloadable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Long-lived per-client flush task.
///
/// Exits after a final flush once every sender is dropped (shutdown).
async fn flush_worker(client: Arc<HecClient>, mut rx: mpsc::Receiver<FlushSignal>) {
    let flush_interval = match &client.batch {
        Some(b) => b.flush_interval,
        None => return,
    };
    let mut deadline: Option<Instant> = None;
    loop {
        let timer = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            sig = rx.recv() => match sig {
                Some(FlushSignal::Arm) => {
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + flush_interval);
                    }
                }
                Some(FlushSignal::Flush) => {
                    client.flush_batch().await;
                    deadline = None;
                }
                None => {
                    client.flush_batch().await;
                    break;
                }
            },
            _ = tokio::time::sleep_until(timer), if deadline.is_some() => {
                client.flush_batch().await;
                deadline = None;
            }
        }
    }
}

/// `min(initial × multiplierⁱ, max_backoff)` for the i-th retry delay.
fn backoff(retry: &RetryConfig, exponent: u32) -> Duration {
    let scaled = retry.initial_backoff.as_secs_f64() * retry.multiplier.powi(exponent as i32);
    if !scaled.is_finite() || scaled < 0.0 {
        return retry.max_backoff;
    }
    retry.max_backoff.min(Duration::from_secs_f64(scaled))
}

/// Rewrite a collector URL (`…/services/collector[/raw|/event]`) to the
/// health probe endpoint.
fn health_url(url: &str) -> String {
    match url.find("/services/collector") {
        Some(idx) => format!("{}/services/collector/health", &url[..idx]),
        None => format!("{}/services/collector/health", url.trim_end_matches('/')),
    }
}

fn gzip_payload(payload: &[u8]) -> Result<Vec<u8>, HecError> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(payload.len() / 2 + 16),
        Compression::default(),
    );
    encoder.write_all(payload).map_err(HecError::Gzip)?;
    encoder.finish().map_err(HecError::Gzip)
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(backoff(&retry, 0), Duration::from_millis(100));
        assert_eq!(backoff(&retry, 1), Duration::from_millis(200));
        assert_eq!(backoff(&retry, 2), Duration::from_millis(400));
        assert_eq!(backoff(&retry, 3), Duration::from_millis(500));
        assert_eq!(backoff(&retry, 4), Duration::from_millis(500));
    }

    #[test]
    fn health_url_rewrites_collector_paths() {
        for (input, expected) in [
            (
                "https://splunk:8088/services/collector/raw",
                "https://splunk:8088/services/collector/health",
            ),
            (
                "https://splunk:8088/services/collector/event",
                "https://splunk:8088/services/collector/health",
            ),
            (
                "https://splunk:8088/services/collector",
                "https://splunk:8088/services/collector/health",
            ),
            (
                "https://splunk:8088",
                "https://splunk:8088/services/collector/health",
            ),
            (
                "https://splunk:8088/",
                "https://splunk:8088/services/collector/health",
            ),
        ] {
            assert_eq!(health_url(input), expected, "input: {}", input);
        }
    }

    #[test]
    fn gzip_payload_round_trips() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let input = b"{\"SessionID\":\"A\"}\n{\"SessionID\":\"B\"}";
        let compressed = gzip_payload(input).unwrap();
        assert_ne!(compressed, input.to_vec());

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, input);
    }
}
