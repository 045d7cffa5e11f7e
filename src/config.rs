//! Relay configuration loading.
//!
//! YAML is the sole config source; no environment variable overrides.
//! Loading goes through raw `Option`-typed structs which are validated
//! into dense config types with defaults applied.
//!
//! # Required fields
//! - At least one `listeners` entry, each with `name`, `listen_addr`,
//!   `log_type`, and `output_dir`
//! - A `splunk` block (global, per-listener, or both) resolving to at
//!   least one HEC target with a url and token
//!
//! # Scoping
//! A listener-level `splunk` block overrides the global one field-by-field
//! in the single-target form; a listener-level `hec_targets` list replaces
//! the global forwarder spec outright. Mixing the single- and multi-target
//! forms inside one scope is rejected.

use crate::acl::Acl;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8090";

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            enabled: false,
            max_lines: 100,
            max_bytes: 512 * 1024,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: 0,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Validated config types
// ---------------------------------------------------------------------------

/// Top-level relay configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub health_check_enabled: bool,
    pub health_check_addr: String,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub name: String,
    pub listen_addr: SocketAddr,
    pub log_type: LogType,
    pub output_dir: PathBuf,
    pub file_prefix: String,
    pub max_line_bytes: usize,
    pub tls: Option<TlsConfig>,
    pub acl: Acl,
    pub read_timeout: Duration,
    pub idle_timeout: Duration,
    pub forwarder: ForwarderConfig,
    /// DLQ directory when dead-lettering is enabled.
    pub dlq_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwarderConfig {
    pub targets: Vec<HecTargetConfig>,
    pub routing: RoutingMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HecTargetConfig {
    /// Unique within a listener's forwarder.
    pub name: String,
    pub url: String,
    pub token: String,
    /// Explicit or derived from the listener's log type.
    pub source_type: String,
    pub gzip: bool,
    pub client_timeout: Duration,
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_lines: usize,
    pub max_bytes: usize,
    pub flush_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// 0 disables the breaker.
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_calls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMode {
    Broadcast,
    PrimaryFailover,
    RoundRobin,
}

impl RoutingMode {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "broadcast" => Ok(RoutingMode::Broadcast),
            "primary-failover" => Ok(RoutingMode::PrimaryFailover),
            "round-robin" => Ok(RoutingMode::RoundRobin),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown routing mode '{}' (expected broadcast, primary-failover, or round-robin)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Broadcast => "broadcast",
            RoutingMode::PrimaryFailover => "primary-failover",
            RoutingMode::RoundRobin => "round-robin",
        }
    }
}

/// The log streams a listener can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    UserActivity,
    UserStatus,
    AppConnectorStatus,
    PseStatus,
    BrowserAccess,
    Audit,
    AppConnectorMetrics,
    PseMetrics,
}

impl LogType {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "user-activity" => Ok(LogType::UserActivity),
            "user-status" => Ok(LogType::UserStatus),
            "app-connector-status" => Ok(LogType::AppConnectorStatus),
            "pse-status" => Ok(LogType::PseStatus),
            "browser-access" => Ok(LogType::BrowserAccess),
            "audit" => Ok(LogType::Audit),
            "app-connector-metrics" => Ok(LogType::AppConnectorMetrics),
            "pse-metrics" => Ok(LogType::PseMetrics),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown log_type '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::UserActivity => "user-activity",
            LogType::UserStatus => "user-status",
            LogType::AppConnectorStatus => "app-connector-status",
            LogType::PseStatus => "pse-status",
            LogType::BrowserAccess => "browser-access",
            LogType::Audit => "audit",
            LogType::AppConnectorMetrics => "app-connector-metrics",
            LogType::PseMetrics => "pse-metrics",
        }
    }

    /// Default Splunk source type.
    ///
    /// Compound component prefixes (`app-connector-`, `pse-`) stay a single
    /// segment: `app-connector-status` maps to `zpa:app-connector:status`.
    pub fn default_source_type(&self) -> &'static str {
        match self {
            LogType::UserActivity => "zpa:user:activity",
            LogType::UserStatus => "zpa:user:status",
            LogType::AppConnectorStatus => "zpa:app-connector:status",
            LogType::PseStatus => "zpa:pse:status",
            LogType::BrowserAccess => "zpa:browser:access",
            LogType::Audit => "zpa:audit",
            LogType::AppConnectorMetrics => "zpa:app-connector:metrics",
            LogType::PseMetrics => "zpa:pse:metrics",
        }
    }

    /// Default storage file prefix: `zpa-{log_type}`.
    pub fn default_file_prefix(&self) -> String {
        format!("zpa-{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Raw YAML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    splunk: Option<RawSplunk>,
    health_check_enabled: Option<bool>,
    health_check_addr: Option<String>,
    listeners: Option<Vec<RawListener>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSplunk {
    hec_url: Option<String>,
    hec_token: Option<String>,
    source_type: Option<String>,
    gzip: Option<bool>,
    client_timeout_seconds: Option<u64>,
    batch: Option<RawBatch>,
    retry: Option<RawRetry>,
    circuit_breaker: Option<RawBreaker>,
    hec_targets: Option<Vec<RawTarget>>,
    routing: Option<RawRouting>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTarget {
    name: Option<String>,
    url: Option<String>,
    token: Option<String>,
    source_type: Option<String>,
    gzip: Option<bool>,
    client_timeout_seconds: Option<u64>,
    batch: Option<RawBatch>,
    retry: Option<RawRetry>,
    circuit_breaker: Option<RawBreaker>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRouting {
    mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBatch {
    enabled: Option<bool>,
    max_lines: Option<usize>,
    max_bytes: Option<usize>,
    flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRetry {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    multiplier: Option<f64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBreaker {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    open_timeout_ms: Option<u64>,
    half_open_max_calls: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawListener {
    name: Option<String>,
    listen_addr: Option<String>,
    log_type: Option<String>,
    output_dir: Option<String>,
    file_prefix: Option<String>,
    max_line_bytes: Option<usize>,
    tls: Option<RawTls>,
    allowed_cidrs: Option<String>,
    timeout: Option<RawTimeout>,
    splunk: Option<RawSplunk>,
    dlq: Option<RawDlq>,
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimeout {
    read_seconds: Option<u64>,
    idle_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDlq {
    enabled: Option<bool>,
    dir: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl RelayConfig {
    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Parse and validate a YAML config string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        validate(raw)
    }
}

fn validate(raw: RawConfig) -> Result<RelayConfig, ConfigError> {
    let raw_listeners = raw
        .listeners
        .ok_or_else(|| ConfigError::MissingField("listeners".to_owned()))?;
    if raw_listeners.is_empty() {
        return Err(ConfigError::InvalidValue(
            "at least one listeners entry is required".to_owned(),
        ));
    }

    let global_splunk = raw.splunk;
    if let Some(g) = &global_splunk {
        check_scope_form(g, "splunk")?;
    }

    let mut names: HashSet<String> = HashSet::new();
    let mut ports: HashSet<u16> = HashSet::new();
    let mut listeners = Vec::with_capacity(raw_listeners.len());

    for (i, l) in raw_listeners.into_iter().enumerate() {
        let name = l
            .name
            .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].name", i)))?;
        if !names.insert(name.clone()) {
            return Err(ConfigError::InvalidValue(format!(
                "duplicate listener name '{}'",
                name
            )));
        }

        let addr_str = l
            .listen_addr
            .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].listen_addr", i)))?;
        let listen_addr: SocketAddr = addr_str.parse().map_err(|_| {
            ConfigError::InvalidValue(format!(
                "listener '{}': invalid listen_addr '{}'",
                name, addr_str
            ))
        })?;
        if !ports.insert(listen_addr.port()) {
            return Err(ConfigError::InvalidValue(format!(
                "listener '{}': duplicate listen port {}",
                name,
                listen_addr.port()
            )));
        }

        let log_type_str = l
            .log_type
            .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].log_type", i)))?;
        let log_type = LogType::parse(&log_type_str)
            .map_err(|e| ConfigError::InvalidValue(format!("listener '{}': {}", name, e)))?;

        let output_dir = l
            .output_dir
            .map(PathBuf::from)
            .ok_or_else(|| ConfigError::MissingField(format!("listeners[{}].output_dir", i)))?;

        let tls = match l.tls {
            None => None,
            Some(t) => Some(validate_tls(t, &name)?),
        };

        let acl = match &l.allowed_cidrs {
            None => Acl::default(),
            Some(csv) => Acl::parse(csv).map_err(|e| {
                ConfigError::InvalidValue(format!("listener '{}': {}", name, e))
            })?,
        };

        let (read_timeout, idle_timeout) = match &l.timeout {
            None => (DEFAULT_READ_TIMEOUT, DEFAULT_IDLE_TIMEOUT),
            Some(t) => (
                t.read_seconds
                    .map_or(DEFAULT_READ_TIMEOUT, Duration::from_secs),
                t.idle_seconds
                    .map_or(DEFAULT_IDLE_TIMEOUT, Duration::from_secs),
            ),
        };

        if let Some(local) = &l.splunk {
            check_scope_form(local, &format!("listener '{}' splunk", name))?;
        }
        let forwarder =
            resolve_forwarder(global_splunk.as_ref(), l.splunk.as_ref(), &name, log_type)?;

        let dlq_dir = match l.dlq {
            Some(d) if d.enabled.unwrap_or(false) => Some(
                d.dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| output_dir.join("dlq")),
            ),
            _ => None,
        };

        listeners.push(ListenerConfig {
            file_prefix: l
                .file_prefix
                .unwrap_or_else(|| log_type.default_file_prefix()),
            max_line_bytes: l.max_line_bytes.unwrap_or(DEFAULT_MAX_LINE_BYTES),
            name,
            listen_addr,
            log_type,
            output_dir,
            tls,
            acl,
            read_timeout,
            idle_timeout,
            forwarder,
            dlq_dir,
        });
    }

    Ok(RelayConfig {
        health_check_enabled: raw.health_check_enabled.unwrap_or(false),
        health_check_addr: raw
            .health_check_addr
            .unwrap_or_else(|| DEFAULT_HEALTH_ADDR.to_owned()),
        listeners,
    })
}

/// Reject configs that mix the single- and multi-target forms in one scope.
fn check_scope_form(s: &RawSplunk, scope: &str) -> Result<(), ConfigError> {
    if s.hec_targets.is_some() && (s.hec_url.is_some() || s.hec_token.is_some()) {
        return Err(ConfigError::InvalidValue(format!(
            "{}: hec_url/hec_token cannot be combined with hec_targets",
            scope
        )));
    }
    if s.routing.is_some() && s.hec_targets.is_none() {
        return Err(ConfigError::InvalidValue(format!(
            "{}: routing requires hec_targets",
            scope
        )));
    }
    Ok(())
}

fn validate_tls(t: RawTls, listener: &str) -> Result<TlsConfig, ConfigError> {
    let (cert, key) = match (t.cert_file, t.key_file) {
        (Some(c), Some(k)) => (PathBuf::from(c), PathBuf::from(k)),
        _ => {
            return Err(ConfigError::InvalidValue(format!(
                "listener '{}': tls requires both cert_file and key_file",
                listener
            )));
        }
    };
    for path in [&cert, &key] {
        std::fs::File::open(path).map_err(|e| {
            ConfigError::InvalidValue(format!(
                "listener '{}': cannot read TLS file '{}': {}",
                listener,
                path.display(),
                e
            ))
        })?;
    }
    Ok(TlsConfig {
        cert_file: cert,
        key_file: key,
    })
}

// ---------------------------------------------------------------------------
// Forwarder resolution: global + listener override → effective targets
// ---------------------------------------------------------------------------

fn resolve_forwarder(
    global: Option<&RawSplunk>,
    local: Option<&RawSplunk>,
    listener: &str,
    log_type: LogType,
) -> Result<ForwarderConfig, ConfigError> {
    // A listener-level hec_targets list replaces the global spec outright.
    if let Some(l) = local {
        if l.hec_targets.is_some() {
            return build_multi(l, listener, log_type);
        }
    }

    match global {
        Some(g) if g.hec_targets.is_some() => {
            if local.is_some() {
                return Err(ConfigError::InvalidValue(format!(
                    "listener '{}': cannot override a multi-target splunk config \
                     field-by-field; provide hec_targets",
                    listener
                )));
            }
            build_multi(g, listener, log_type)
        }
        _ => build_single(global, local, listener, log_type),
    }
}

/// Single-target form: listener fields override global fields one by one.
fn build_single(
    global: Option<&RawSplunk>,
    local: Option<&RawSplunk>,
    listener: &str,
    log_type: LogType,
) -> Result<ForwarderConfig, ConfigError> {
    if global.is_none() && local.is_none() {
        return Err(ConfigError::MissingField(format!(
            "listener '{}': no splunk configuration at listener or global scope",
            listener
        )));
    }

    let pick = |f: fn(&RawSplunk) -> Option<String>| -> Option<String> {
        local.and_then(f).or_else(|| global.and_then(f))
    };

    let url = pick(|s| s.hec_url.clone()).ok_or_else(|| {
        ConfigError::MissingField(format!("listener '{}': splunk.hec_url", listener))
    })?;
    let token = pick(|s| s.hec_token.clone()).ok_or_else(|| {
        ConfigError::MissingField(format!("listener '{}': splunk.hec_token", listener))
    })?;
    let source_type = pick(|s| s.source_type.clone())
        .unwrap_or_else(|| log_type.default_source_type().to_owned());
    let gzip = local
        .and_then(|s| s.gzip)
        .or_else(|| global.and_then(|s| s.gzip))
        .unwrap_or(false);
    let client_timeout = local
        .and_then(|s| s.client_timeout_seconds)
        .or_else(|| global.and_then(|s| s.client_timeout_seconds))
        .map_or(DEFAULT_CLIENT_TIMEOUT, Duration::from_secs);
    let batch = build_batch(
        local
            .and_then(|s| s.batch.clone())
            .or_else(|| global.and_then(|s| s.batch.clone())),
    );
    let retry = build_retry(
        local
            .and_then(|s| s.retry.clone())
            .or_else(|| global.and_then(|s| s.retry.clone())),
    )?;
    let circuit_breaker = build_breaker(
        local
            .and_then(|s| s.circuit_breaker.clone())
            .or_else(|| global.and_then(|s| s.circuit_breaker.clone())),
    );

    Ok(ForwarderConfig {
        targets: vec![HecTargetConfig {
            name: "default".to_owned(),
            url,
            token,
            source_type,
            gzip,
            client_timeout,
            batch,
            retry,
            circuit_breaker,
        }],
        routing: RoutingMode::PrimaryFailover,
    })
}

/// Multi-target form: explicit target list plus routing mode.
fn build_multi(
    scope: &RawSplunk,
    listener: &str,
    log_type: LogType,
) -> Result<ForwarderConfig, ConfigError> {
    let raw_targets = scope
        .hec_targets
        .as_ref()
        .ok_or_else(|| ConfigError::MissingField("hec_targets".to_owned()))?;
    if raw_targets.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "listener '{}': hec_targets must not be empty",
            listener
        )));
    }

    let routing = match scope.routing.as_ref().and_then(|r| r.mode.clone()) {
        Some(mode) => RoutingMode::parse(&mode)
            .map_err(|e| ConfigError::InvalidValue(format!("listener '{}': {}", listener, e)))?,
        None => RoutingMode::Broadcast,
    };

    let mut names: HashSet<String> = HashSet::new();
    let mut targets = Vec::with_capacity(raw_targets.len());
    for (i, t) in raw_targets.iter().enumerate() {
        let name = t.name.clone().ok_or_else(|| {
            ConfigError::MissingField(format!(
                "listener '{}': hec_targets[{}].name",
                listener, i
            ))
        })?;
        if !names.insert(name.clone()) {
            return Err(ConfigError::InvalidValue(format!(
                "listener '{}': duplicate hec target name '{}'",
                listener, name
            )));
        }
        let url = t.url.clone().ok_or_else(|| {
            ConfigError::MissingField(format!(
                "listener '{}': hec_targets[{}].url",
                listener, i
            ))
        })?;
        let token = t.token.clone().ok_or_else(|| {
            ConfigError::MissingField(format!(
                "listener '{}': hec_targets[{}].token",
                listener, i
            ))
        })?;
        let source_type = t
            .source_type
            .clone()
            .or_else(|| scope.source_type.clone())
            .unwrap_or_else(|| log_type.default_source_type().to_owned());

        targets.push(HecTargetConfig {
            gzip: t.gzip.or(scope.gzip).unwrap_or(false),
            client_timeout: t
                .client_timeout_seconds
                .or(scope.client_timeout_seconds)
                .map_or(DEFAULT_CLIENT_TIMEOUT, Duration::from_secs),
            batch: build_batch(t.batch.clone().or_else(|| scope.batch.clone())),
            retry: build_retry(t.retry.clone().or_else(|| scope.retry.clone()))?,
            circuit_breaker: build_breaker(
                t.circuit_breaker
                    .clone()
                    .or_else(|| scope.circuit_breaker.clone()),
            ),
            name,
            url,
            token,
            source_type,
        });
    }

    Ok(ForwarderConfig { targets, routing })
}

fn build_batch(raw: Option<RawBatch>) -> BatchConfig {
    let defaults = BatchConfig::default();
    match raw {
        None => defaults,
        Some(b) => BatchConfig {
            enabled: b.enabled.unwrap_or(defaults.enabled),
            max_lines: b.max_lines.unwrap_or(defaults.max_lines),
            max_bytes: b.max_bytes.unwrap_or(defaults.max_bytes),
            flush_interval: b
                .flush_interval_ms
                .map_or(defaults.flush_interval, Duration::from_millis),
        },
    }
}

fn build_retry(raw: Option<RawRetry>) -> Result<RetryConfig, ConfigError> {
    let defaults = RetryConfig::default();
    let retry = match raw {
        None => defaults,
        Some(r) => RetryConfig {
            max_attempts: r.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: r
                .initial_backoff_ms
                .map_or(defaults.initial_backoff, Duration::from_millis),
            multiplier: r.multiplier.unwrap_or(defaults.multiplier),
            max_backoff: r
                .max_backoff_ms
                .map_or(defaults.max_backoff, Duration::from_millis),
        },
    };
    if retry.max_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "retry.max_attempts must be at least 1".to_owned(),
        ));
    }
    Ok(retry)
}

fn build_breaker(raw: Option<RawBreaker>) -> CircuitBreakerConfig {
    let defaults = CircuitBreakerConfig::default();
    match raw {
        None => defaults,
        Some(b) => CircuitBreakerConfig {
            failure_threshold: b.failure_threshold.unwrap_or(defaults.failure_threshold),
            success_threshold: b.success_threshold.unwrap_or(defaults.success_threshold),
            open_timeout: b
                .open_timeout_ms
                .map_or(defaults.open_timeout, Duration::from_millis),
            half_open_max_calls: b
                .half_open_max_calls
                .unwrap_or(defaults.half_open_max_calls),
        },
    }
}

// ---------------------------------------------------------------------------
// Reload diff
// ---------------------------------------------------------------------------

/// The per-listener changes a SIGHUP reload may apply.
#[derive(Debug, Default)]
pub struct ListenerReload {
    pub name: String,
    /// New ACL when the ruleset changed.
    pub acl: Option<Acl>,
    /// Per-target credential updates: (target name, token, source_type, gzip).
    pub targets: Vec<TargetReload>,
}

#[derive(Debug)]
pub struct TargetReload {
    pub name: String,
    pub token: String,
    pub source_type: String,
    pub gzip: bool,
}

/// Everything a validated reload is allowed to change.
#[derive(Debug, Default)]
pub struct ReloadPlan {
    pub health_changed: bool,
    pub listeners: Vec<ListenerReload>,
}

impl ReloadPlan {
    pub fn is_empty(&self) -> bool {
        !self.health_changed && self.listeners.iter().all(|l| l.acl.is_none() && l.targets.is_empty())
    }
}

/// Compare old and new configs and produce the reloadable delta.
///
/// Any difference outside the reloadable subset (ACLs, target credentials,
/// health endpoint) is an error; the caller keeps the old config.
pub fn diff_reloadable(old: &RelayConfig, new: &RelayConfig) -> Result<ReloadPlan, ConfigError> {
    let old_names: Vec<&str> = old.listeners.iter().map(|l| l.name.as_str()).collect();
    let new_names: Vec<&str> = new.listeners.iter().map(|l| l.name.as_str()).collect();
    if old_names != new_names {
        return Err(ConfigError::InvalidValue(
            "the set of listeners is not reloadable; restart to change it".to_owned(),
        ));
    }

    let mut plan = ReloadPlan {
        health_changed: old.health_check_enabled != new.health_check_enabled
            || old.health_check_addr != new.health_check_addr,
        listeners: Vec::new(),
    };

    for (o, n) in old.listeners.iter().zip(new.listeners.iter()) {
        check_frozen(o, n)?;

        let mut reload = ListenerReload {
            name: o.name.clone(),
            acl: None,
            targets: Vec::new(),
        };
        if o.acl != n.acl {
            reload.acl = Some(n.acl.clone());
        }
        for (ot, nt) in o.forwarder.targets.iter().zip(n.forwarder.targets.iter()) {
            if ot.token != nt.token || ot.source_type != nt.source_type || ot.gzip != nt.gzip {
                reload.targets.push(TargetReload {
                    name: nt.name.clone(),
                    token: nt.token.clone(),
                    source_type: nt.source_type.clone(),
                    gzip: nt.gzip,
                });
            }
        }
        plan.listeners.push(reload);
    }

    Ok(plan)
}

/// Reject differences in the non-reloadable parts of a listener.
fn check_frozen(old: &ListenerConfig, new: &ListenerConfig) -> Result<(), ConfigError> {
    let frozen = |field: &str| {
        Err(ConfigError::InvalidValue(format!(
            "listener '{}': {} is not reloadable; restart to change it",
            old.name, field
        )))
    };

    if old.listen_addr != new.listen_addr {
        return frozen("listen_addr");
    }
    if old.log_type != new.log_type {
        return frozen("log_type");
    }
    if old.output_dir != new.output_dir || old.file_prefix != new.file_prefix {
        return frozen("storage layout");
    }
    if old.max_line_bytes != new.max_line_bytes {
        return frozen("max_line_bytes");
    }
    if old.tls != new.tls {
        return frozen("tls");
    }
    if old.read_timeout != new.read_timeout || old.idle_timeout != new.idle_timeout {
        return frozen("timeout");
    }
    if old.dlq_dir != new.dlq_dir {
        return frozen("dlq");
    }
    if old.forwarder.routing != new.forwarder.routing {
        return frozen("routing mode");
    }
    if old.forwarder.targets.len() != new.forwarder.targets.len() {
        return frozen("hec target set");
    }
    for (ot, nt) in old
        .forwarder
        .targets
        .iter()
        .zip(new.forwarder.targets.iter())
    {
        if ot.name != nt.name || ot.url != nt.url {
            return frozen("hec target set");
        }
        if ot.client_timeout != nt.client_timeout
            || ot.batch != nt.batch
            || ot.retry != nt.retry
            || ot.circuit_breaker != nt.circuit_breaker
        {
            return frozen("hec batching/retry/circuit-breaker settings");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Config template
// ---------------------------------------------------------------------------

/// A commented starter config, printed by the `template` subcommand.
pub fn template() -> &'static str {
    r#"# zpa-relay configuration template.
#
# Global Splunk HEC settings apply to every listener unless a listener
# provides its own `splunk` block.
splunk:
  hec_url: "https://splunk.example.com:8088/services/collector/raw"
  hec_token: "00000000-0000-0000-0000-000000000000"
  # source_type: "zpa:user:activity"   # derived from log_type when omitted
  gzip: false
  client_timeout_seconds: 15
  batch:
    enabled: false
    max_lines: 100
    max_bytes: 524288
    flush_interval_ms: 5000
  retry:
    max_attempts: 3
    initial_backoff_ms: 1000
    multiplier: 2.0
    max_backoff_ms: 30000
  circuit_breaker:
    failure_threshold: 0        # 0 disables the breaker
    success_threshold: 1
    open_timeout_ms: 30000
    half_open_max_calls: 1

# Multi-target form (replaces hec_url/hec_token above):
# splunk:
#   hec_targets:
#     - name: "primary"
#       url: "https://splunk-a.example.com:8088/services/collector/raw"
#       token: "..."
#     - name: "secondary"
#       url: "https://splunk-b.example.com:8088/services/collector/raw"
#       token: "..."
#   routing:
#     mode: primary-failover    # broadcast | primary-failover | round-robin

health_check_enabled: true
health_check_addr: "127.0.0.1:8090"

listeners:
  - name: "user-activity"
    listen_addr: "0.0.0.0:9000"
    log_type: user-activity
    output_dir: "/var/lib/zpa-relay/user-activity"
    # file_prefix: "zpa-user-activity"  # default: zpa-{log_type}
    max_line_bytes: 1048576
    # tls:
    #   cert_file: "/etc/zpa-relay/tls/cert.pem"
    #   key_file: "/etc/zpa-relay/tls/key.pem"
    # allowed_cidrs: "10.0.0.0/8, 192.168.0.0/16"
    timeout:
      read_seconds: 60
      idle_seconds: 300
    dlq:
      enabled: true
      # dir: "/var/lib/zpa-relay/user-activity/dlq"
"#
}
