//! Fan-out across HEC targets.
//!
//! A forwarder is either a single client or a set of clients with a
//! routing mode:
//!
//! - **broadcast** — every target gets every record; the submission fails
//!   if any target failed, with the failing target names in the error.
//! - **primary-failover** — targets are tried in configured order; first
//!   success wins.
//! - **round-robin** — an atomic counter picks exactly one target per
//!   submission. A failing pick still advances the counter; the error is
//!   returned to the submitting task.

use crate::config::{ForwarderConfig, RoutingMode};
use crate::hec::{HecClient, HecError};
use crate::metrics::RelayMetrics;
use crate::storage::DlqWriter;
use futures_util::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// One listener's delivery fan-out.
pub enum HecForwarder {
    Single(Arc<HecClient>),
    Multi(MultiForwarder),
}

pub struct MultiForwarder {
    clients: Vec<Arc<HecClient>>,
    mode: RoutingMode,
    next: AtomicUsize,
}

impl HecForwarder {
    /// Build the forwarder (and its clients) from a validated config.
    pub fn new(
        cfg: &ForwarderConfig,
        dlq: Option<Arc<DlqWriter>>,
        metrics: Arc<RelayMetrics>,
    ) -> Result<Self, HecError> {
        let mut clients = Vec::with_capacity(cfg.targets.len());
        for target in &cfg.targets {
            clients.push(HecClient::new(target, dlq.clone(), metrics.clone())?);
        }
        if clients.len() == 1 {
            let only = clients.remove(0);
            return Ok(HecForwarder::Single(only));
        }
        Ok(HecForwarder::Multi(MultiForwarder {
            clients,
            mode: cfg.routing,
            next: AtomicUsize::new(0),
        }))
    }

    /// Submit one record according to the routing mode.
    pub async fn forward(&self, conn_id: &str, record: &[u8]) -> Result<(), HecError> {
        match self {
            HecForwarder::Single(client) => client.forward(conn_id, record).await,
            HecForwarder::Multi(multi) => multi.forward(conn_id, record).await,
        }
    }

    /// Health-check every target, returning one verdict per target.
    pub async fn health_check(&self) -> Vec<(String, Result<(), HecError>)> {
        let clients = self.clients();
        let results = join_all(clients.iter().map(|c| c.health_check())).await;
        clients
            .iter()
            .map(|c| c.name().to_owned())
            .zip(results)
            .collect()
    }

    /// Shut every client down under a shared deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), HecError> {
        let results = join_all(self.clients().iter().map(|c| c.shutdown(deadline))).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Apply a reloadable update to the named target.
    pub fn update_target(&self, name: &str, token: String, source_type: String, gzip: bool) {
        for client in self.clients() {
            if client.name() == name {
                client.update_config(token, source_type, gzip);
                return;
            }
        }
        debug!(target_name = %name, "reload update for unknown target ignored");
    }

    pub fn clients(&self) -> &[Arc<HecClient>] {
        match self {
            HecForwarder::Single(client) => std::slice::from_ref(client),
            HecForwarder::Multi(multi) => &multi.clients,
        }
    }
}

impl MultiForwarder {
    async fn forward(&self, conn_id: &str, record: &[u8]) -> Result<(), HecError> {
        match self.mode {
            RoutingMode::Broadcast => {
                let results =
                    join_all(self.clients.iter().map(|c| c.forward(conn_id, record))).await;
                let failed: Vec<&str> = self
                    .clients
                    .iter()
                    .zip(&results)
                    .filter(|(_, r)| r.is_err())
                    .map(|(c, _)| c.name())
                    .collect();
                if failed.is_empty() {
                    Ok(())
                } else {
                    Err(HecError::Broadcast(failed.join(", ")))
                }
            }
            RoutingMode::PrimaryFailover => {
                let mut errors = Vec::with_capacity(self.clients.len());
                for client in &self.clients {
                    match client.forward(conn_id, record).await {
                        Ok(()) => return Ok(()),
                        Err(e) => errors.push(format!("{}: {}", client.name(), e)),
                    }
                }
                Err(HecError::AllTargetsFailed(errors.join("; ")))
            }
            RoutingMode::RoundRobin => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
                self.clients[idx].forward(conn_id, record).await
            }
        }
    }
}
