//! Process lifecycle: component wiring, signals, reload, shutdown.
//!
//! The supervisor owns every listener's component tree (DLQ → forwarder →
//! store → listener), the shared metrics, and the optional health
//! endpoint. Ports are bound during `build`, before anything starts, so a
//! taken port fails startup instead of surfacing later.
//!
//! # Signals
//! - SIGINT / SIGTERM: graceful shutdown — stop accepting, drain handlers
//!   under a shared deadline, drain forwarders under their own deadline,
//!   close the stores.
//! - SIGHUP: reload. Only ACLs, HEC credentials (token / source_type /
//!   gzip), and the health endpoint are reloadable; any other change is
//!   rejected and the previous configuration stays in force.

use crate::config::{self, RelayConfig};
use crate::health_http::HealthServer;
use crate::hec::{HecError, HecForwarder};
use crate::listener::{Listener, ListenerError};
use crate::metrics::RelayMetrics;
use crate::storage::{DayStore, DlqWriter, StoreError};
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shared deadline for draining connection handlers.
pub const LISTENER_DRAIN: Duration = Duration::from_secs(30);
/// Deadline for draining forwarder flush workers.
pub const FORWARDER_DRAIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hec(#[from] HecError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("health endpoint: {0}")]
    Health(#[source] std::io::Error),
    #[error("installing signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

struct ListenerRuntime {
    listener: Arc<Listener>,
    forwarder: Arc<HecForwarder>,
    store: Arc<DayStore>,
    dlq: Option<Arc<DlqWriter>>,
    accept: Option<JoinHandle<()>>,
}

/// Owns and drives the whole relay.
pub struct Supervisor {
    config_path: PathBuf,
    config: RelayConfig,
    runtimes: Vec<ListenerRuntime>,
    health: Option<HealthServer>,
    metrics: Arc<RelayMetrics>,
}

impl Supervisor {
    /// Construct every listener's component tree and bind all ports.
    pub async fn build(
        config_path: PathBuf,
        config: RelayConfig,
    ) -> Result<Self, SupervisorError> {
        let metrics = Arc::new(RelayMetrics::new());
        let mut runtimes = Vec::with_capacity(config.listeners.len());

        for cfg in &config.listeners {
            let dlq = match &cfg.dlq_dir {
                None => None,
                Some(dir) => Some(Arc::new(DlqWriter::new(dir)?)),
            };
            let store = Arc::new(DayStore::new(&cfg.output_dir, &cfg.file_prefix)?);
            let forwarder = Arc::new(HecForwarder::new(
                &cfg.forwarder,
                dlq.clone(),
                metrics.clone(),
            )?);
            let listener = Arc::new(
                Listener::bind(cfg, store.clone(), forwarder.clone(), metrics.clone()).await?,
            );
            info!(
                listener = %cfg.name,
                addr = %listener.local_addr(),
                log_type = %cfg.log_type.as_str(),
                "listener bound"
            );
            runtimes.push(ListenerRuntime {
                listener,
                forwarder,
                store,
                dlq,
                accept: None,
            });
        }

        Ok(Supervisor {
            config_path,
            config,
            runtimes,
            health: None,
            metrics,
        })
    }

    /// Start the accept loops and (if enabled) the health endpoint.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        for rt in &mut self.runtimes {
            rt.accept = Some(rt.listener.start());
        }
        if self.config.health_check_enabled {
            let server = HealthServer::start(&self.config.health_check_addr, self.metrics.clone())
                .await
                .map_err(SupervisorError::Health)?;
            info!(addr = %server.local_addr(), "health endpoint started");
            self.health = Some(server);
        }
        Ok(())
    }

    /// Run until SIGINT/SIGTERM, reloading on SIGHUP.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.start().await?;

        let mut sigterm =
            signal(SignalKind::terminate()).map_err(SupervisorError::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(SupervisorError::Signal)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(SupervisorError::Signal)?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received; shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received; shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    self.reload().await;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Graceful teardown. Deadline overruns are logged and abandoned so the
    /// process always finishes tearing down.
    pub async fn shutdown(&mut self) {
        // 1. Stop accepting everywhere, then drain handlers concurrently
        //    under the shared deadline.
        let drains = self
            .runtimes
            .iter()
            .map(|rt| rt.listener.shutdown(LISTENER_DRAIN));
        for result in join_all(drains).await {
            if let Err(e) = result {
                warn!(error = %e, "listener drain incomplete");
            }
        }
        for rt in &mut self.runtimes {
            if let Some(accept) = rt.accept.take() {
                let _ = accept.await;
            }
        }

        // 2. Drain forwarder flush workers.
        let flushes = self
            .runtimes
            .iter()
            .map(|rt| rt.forwarder.shutdown(FORWARDER_DRAIN));
        for result in join_all(flushes).await {
            if let Err(e) = result {
                warn!(error = %e, "forwarder drain incomplete");
            }
        }

        // 3. Close the durable sinks.
        for rt in &self.runtimes {
            if let Err(e) = rt.store.close() {
                warn!(error = %e, "closing store failed");
            }
            if let Some(dlq) = &rt.dlq {
                if let Err(e) = dlq.close() {
                    warn!(error = %e, "closing DLQ failed");
                }
            }
        }

        if let Some(health) = self.health.take() {
            health.stop();
        }
        info!("shutdown complete");
    }

    /// Re-read the config file and apply the reloadable subset.
    ///
    /// Validation or topology failures keep the previous configuration.
    pub async fn reload(&mut self) {
        info!(path = %self.config_path.display(), "SIGHUP received; reloading configuration");
        let new = match RelayConfig::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "reload failed; keeping previous configuration");
                return;
            }
        };
        let plan = match config::diff_reloadable(&self.config, &new) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "reload rejected; keeping previous configuration");
                return;
            }
        };

        if plan.is_empty() {
            info!("reload: no reloadable changes");
            self.config = new;
            return;
        }

        let mut applied: Vec<String> = Vec::new();
        for (rt, l) in self.runtimes.iter().zip(plan.listeners) {
            if let Some(acl) = l.acl {
                rt.listener.swap_acl(acl);
                applied.push(format!("{}: acl", l.name));
            }
            for t in l.targets {
                rt.forwarder
                    .update_target(&t.name, t.token, t.source_type, t.gzip);
                applied.push(format!("{}: hec credentials ({})", l.name, t.name));
            }
        }

        if plan.health_changed {
            if let Some(health) = self.health.take() {
                health.stop();
            }
            if new.health_check_enabled {
                match HealthServer::start(&new.health_check_addr, self.metrics.clone()).await {
                    Ok(server) => {
                        info!(addr = %server.local_addr(), "health endpoint restarted");
                        self.health = Some(server);
                    }
                    Err(e) => error!(error = %e, "restarting health endpoint failed"),
                }
            }
            applied.push("health endpoint".to_owned());
        }

        info!(fields = %applied.join(", "), "reload applied");
        self.config = new;
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Bound address of each listener, in config order.
    pub fn listener_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.runtimes
            .iter()
            .map(|rt| rt.listener.local_addr())
            .collect()
    }

    /// Bound address of the health endpoint, when enabled.
    pub fn health_addr(&self) -> Option<std::net::SocketAddr> {
        self.health.as_ref().map(|h| h.local_addr())
    }
}
