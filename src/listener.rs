//! Per-listener accept loop and connection handling.
//!
//! A listener binds one TCP (optionally TLS-terminating) socket and, for
//! every admitted connection, runs the ingest loop: framed read → JSON
//! well-formedness gate → synchronous DayStore append → forwarder hand-off
//! on a spawned task.
//!
//! The synchronous append before the hand-off is the durability barrier:
//! an overloaded HEC never buffers records in the ingest path, and a
//! record that could not be stored is not forwarded.
//!
//! # Ordering
//! Within a connection, record i is appended before record i+1 is read.
//! Forward submissions are handed off in read order, but delivery order at
//! the HEC is not guaranteed (retries and multi-target routing reorder).

use crate::acl::Acl;
use crate::config::ListenerConfig;
use crate::hec::HecForwarder;
use crate::line_reader::{LineReader, ReadError};
use crate::metrics::{RelayMetrics, dec, inc};
use crate::storage::DayStore;
use crate::tls::TlsError;
use serde::de::IgnoredAny;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::net::TcpListener as TcpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause before re-arming accept after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Poll interval while waiting for in-flight handlers to drain.
const DRAIN_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener '{name}': binding {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener '{name}': {source}")]
    Tls {
        name: String,
        #[source]
        source: TlsError,
    },
    #[error("listener '{name}': {active} connection(s) still active after {waited:?}")]
    ShutdownTimeout {
        name: String,
        active: usize,
        waited: Duration,
    },
}

/// One bound listener and its connection handlers.
pub struct Listener {
    name: String,
    local_addr: SocketAddr,
    max_line_bytes: usize,
    read_timeout: Duration,
    idle_timeout: Duration,
    /// Taken by `start`; dropping it closes the bind socket.
    socket: Mutex<Option<TcpSocket>>,
    tls: Option<TlsAcceptor>,
    acl: Arc<RwLock<Acl>>,
    store: Arc<DayStore>,
    forwarder: Arc<HecForwarder>,
    metrics: Arc<RelayMetrics>,
    active: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl Listener {
    /// Validate the TLS material (if any) and bind the listen socket.
    ///
    /// Binding here, before anything else starts, makes port conflicts a
    /// startup failure instead of a runtime surprise.
    pub async fn bind(
        cfg: &ListenerConfig,
        store: Arc<DayStore>,
        forwarder: Arc<HecForwarder>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self, ListenerError> {
        let tls = match &cfg.tls {
            None => None,
            Some(paths) => {
                let server_config = crate::tls::load_server_config(
                    &paths.cert_file,
                    &paths.key_file,
                )
                .map_err(|source| ListenerError::Tls {
                    name: cfg.name.clone(),
                    source,
                })?;
                Some(TlsAcceptor::from(server_config))
            }
        };

        let socket = TcpSocket::bind(cfg.listen_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                name: cfg.name.clone(),
                addr: cfg.listen_addr,
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            name: cfg.name.clone(),
            addr: cfg.listen_addr,
            source,
        })?;

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Listener {
            name: cfg.name.clone(),
            local_addr,
            max_line_bytes: cfg.max_line_bytes,
            read_timeout: cfg.read_timeout,
            idle_timeout: cfg.idle_timeout,
            socket: Mutex::new(Some(socket)),
            tls,
            acl: Arc::new(RwLock::new(cfg.acl.clone())),
            store,
            forwarder,
            metrics,
            active: AtomicUsize::new(0),
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address (resolves port 0 to the real port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<DayStore> {
        &self.store
    }

    pub fn forwarder(&self) -> &Arc<HecForwarder> {
        &self.forwarder
    }

    /// Swap the ACL ruleset (SIGHUP reload).
    pub fn swap_acl(&self, acl: Acl) {
        *self.acl.write().unwrap_or_else(PoisonError::into_inner) = acl;
    }

    /// Spawn the accept loop. Call at most once.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let this = self.clone();
        tokio::spawn(async move {
            match socket {
                Some(socket) => this.accept_loop(socket).await,
                None => warn!(listener = %this.name, "start called twice; ignoring"),
            }
        })
    }

    /// Stop accepting and wait up to `deadline` for handlers to finish.
    ///
    /// Handlers still running at the deadline are abandoned; they exit on
    /// their own when their socket closes or times out.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ListenerError> {
        let _ = self.shutdown_tx.send(true);
        let started = Instant::now();
        loop {
            let active = self.active.load(Ordering::SeqCst);
            if active == 0 {
                return Ok(());
            }
            if started.elapsed() >= deadline {
                let waited = started.elapsed();
                warn!(
                    listener = %self.name,
                    active,
                    waited_ms = waited.as_millis() as u64,
                    "shutdown deadline exceeded; abandoning handlers"
                );
                return Err(ListenerError::ShutdownTimeout {
                    name: self.name.clone(),
                    active,
                    waited,
                });
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    // -----------------------------------------------------------------------
    // Accept loop
    // -----------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, socket: TcpSocket) {
        info!(listener = %self.name, addr = %self.local_addr, "accepting connections");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => self.clone().admit(stream, peer),
                    Err(e) => {
                        warn!(listener = %self.name, error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        }
        // Dropping the socket here closes the bind address.
        info!(listener = %self.name, "accept loop stopped");
    }

    fn admit(self: Arc<Self>, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let allowed = self
            .acl
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allows(peer.ip());
        if !allowed {
            warn!(listener = %self.name, peer = %peer, "connection denied by ACL");
            inc(&self.metrics.acl_denied);
            return;
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        inc(&self.metrics.active_connections);
        let this = self.clone();
        tokio::spawn(async move {
            let conn_id = Uuid::new_v4().to_string();
            match &this.tls {
                None => this.handle_conn(stream, peer, &conn_id).await,
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => this.handle_conn(tls_stream, peer, &conn_id).await,
                    Err(e) => {
                        warn!(
                            listener = %this.name,
                            peer = %peer,
                            error = %e,
                            "TLS handshake failed"
                        );
                    }
                },
            }
            this.active.fetch_sub(1, Ordering::SeqCst);
            dec(&this.metrics.active_connections);
        });
    }

    // -----------------------------------------------------------------------
    // Per-connection handler
    // -----------------------------------------------------------------------

    async fn handle_conn<S>(&self, stream: S, peer: SocketAddr, conn_id: &str)
    where
        S: AsyncRead + Unpin,
    {
        info!(listener = %self.name, peer = %peer, conn_id = %conn_id, "connection opened");
        let mut reader = LineReader::new(stream, self.max_line_bytes, self.read_timeout);

        loop {
            let line = match tokio::time::timeout(self.idle_timeout, reader.read_line()).await {
                Err(_) => {
                    warn!(
                        listener = %self.name,
                        conn_id = %conn_id,
                        idle_ms = self.idle_timeout.as_millis() as u64,
                        "idle timeout; closing connection"
                    );
                    break;
                }
                Ok(Err(ReadError::Oversize { limit })) => {
                    warn!(
                        listener = %self.name,
                        conn_id = %conn_id,
                        limit,
                        "record over size cap dropped"
                    );
                    inc(&self.metrics.oversize);
                    continue;
                }
                Ok(Err(ReadError::Timeout(t))) => {
                    warn!(
                        listener = %self.name,
                        conn_id = %conn_id,
                        read_ms = t.as_millis() as u64,
                        "read timeout; closing connection"
                    );
                    break;
                }
                Ok(Err(ReadError::Io(e))) => {
                    warn!(listener = %self.name, conn_id = %conn_id, error = %e, "read failed");
                    break;
                }
                Ok(Ok(None)) => {
                    debug!(listener = %self.name, conn_id = %conn_id, "peer closed connection");
                    break;
                }
                Ok(Ok(Some(line))) => line,
            };

            inc(&self.metrics.records_received);

            if serde_json::from_slice::<IgnoredAny>(&line).is_err() {
                let preview_len = line.len().min(200);
                warn!(
                    listener = %self.name,
                    conn_id = %conn_id,
                    preview = %String::from_utf8_lossy(&line[..preview_len]),
                    "invalid JSON record dropped"
                );
                inc(&self.metrics.invalid_json);
                continue;
            }

            // Durability barrier: a record that could not be stored is not
            // forwarded.
            if let Err(e) = self.store.append(&line) {
                error!(
                    listener = %self.name,
                    conn_id = %conn_id,
                    error = %e,
                    "storage append failed; record not forwarded"
                );
                continue;
            }
            inc(&self.metrics.records_stored);

            let forwarder = self.forwarder.clone();
            let id = conn_id.to_owned();
            let listener_name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = forwarder.forward(&id, &line).await {
                    warn!(
                        listener = %listener_name,
                        conn_id = %id,
                        error = %e,
                        "forward failed"
                    );
                }
            });
        }
        info!(listener = %self.name, peer = %peer, conn_id = %conn_id, "connection closed");
    }
}
