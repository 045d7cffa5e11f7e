//! Local health/metrics HTTP endpoint.
//!
//! Provides:
//! - `GET /healthz`  — always 200 OK (process is running)
//! - `GET /metrics`  — 200 with a JSON snapshot of the relay counters
//!
//! Enabled by `health_check_enabled`; a SIGHUP reload may stop, start, or
//! move it. No authentication; the endpoint is read-only.

use crate::metrics::RelayMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Handle to the running health endpoint.
pub struct HealthServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthServer {
    /// Bind `addr` and start serving in a background task.
    pub async fn start(addr: &str, metrics: Arc<RelayMetrics>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let metrics = metrics.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, metrics).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Ok(HealthServer {
            local_addr,
            shutdown_tx,
        })
    }

    /// Return the bound listen address (useful when port 0 was used).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop and release the port.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn handle_connection(mut stream: TcpStream, metrics: Arc<RelayMetrics>) {
    // A simple HTTP/1.1 request line + headers fits comfortably in 4 KiB.
    let mut buf = vec![0u8; 4096];
    let n = match stream.read(&mut buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };

    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };

    let first_line = match request.lines().next() {
        Some(l) => l,
        None => {
            send_response(&mut stream, 400, "text/plain", "Bad Request").await;
            return;
        }
    };
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("/");

    match (method, path) {
        ("GET", "/healthz") => {
            send_response(&mut stream, 200, "text/plain", "ok").await;
        }
        ("GET", "/metrics") => {
            let snapshot = metrics.snapshot();
            match serde_json::to_string(&snapshot) {
                Ok(body) => send_response(&mut stream, 200, "application/json", &body).await,
                Err(e) => {
                    send_response(&mut stream, 500, "text/plain", &e.to_string()).await;
                }
            }
        }
        _ => {
            send_response(&mut stream, 404, "text/plain", "Not Found").await;
        }
    }
}

async fn send_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    };
    let response = format!(
        "HTTP/1.1 {status} {status_text}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        len = body.len(),
    );
    let _ = stream.write_all(response.as_bytes()).await;
}
