//! HEC client delivery: retry, DLQ on exhaustion, circuit breaking,
//! health checks.

mod support;

use std::sync::Arc;
use std::time::Duration;
use support::MockHec;
use zpa_relay::config::{BatchConfig, CircuitBreakerConfig, HecTargetConfig, RetryConfig};
use zpa_relay::hec::{HecClient, HecError};
use zpa_relay::metrics::RelayMetrics;
use zpa_relay::storage::{DlqEntry, DlqWriter};

fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_backoff: Duration::from_millis(10),
        multiplier: 2.0,
        max_backoff: Duration::from_millis(50),
    }
}

fn target(url: &str) -> HecTargetConfig {
    HecTargetConfig {
        name: "default".to_owned(),
        url: url.to_owned(),
        token: "test-token".to_owned(),
        source_type: "zpa:user:activity".to_owned(),
        gzip: false,
        client_timeout: Duration::from_secs(5),
        batch: BatchConfig::default(),
        retry: fast_retry(3),
        circuit_breaker: CircuitBreakerConfig::default(),
    }
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let mock = MockHec::start().await;
    mock.push_statuses(&[503, 503]);
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), None, metrics.clone()).unwrap();

    client
        .forward("conn-1", b"{\"SessionID\":\"A\"}")
        .await
        .unwrap();

    assert_eq!(mock.event_posts().len(), 3);
    let snap = metrics.snapshot();
    assert_eq!(snap.forward_retries, 2);
    assert_eq!(snap.records_forwarded, 1);
    assert_eq!(snap.forward_failures, 0);
}

#[tokio::test]
async fn exhausted_retries_write_a_dlq_entry() {
    let mock = MockHec::start().await;
    mock.set_default_status(503);
    let dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(DlqWriter::new(dir.path()).unwrap());
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), Some(dlq.clone()), metrics.clone()).unwrap();

    let err = client
        .forward("conn-42", b"{\"SessionID\":\"A\"}")
        .await
        .unwrap_err();
    assert!(matches!(err, HecError::Status { .. }), "{}", err);
    assert_eq!(mock.event_posts().len(), 3, "one try plus two retries");

    let contents = std::fs::read_to_string(dlq.current_file().unwrap()).unwrap();
    let entry: DlqEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
    assert_eq!(entry.conn_id, "conn-42");
    assert!(entry.error.contains("503"), "{}", entry.error);
    assert_eq!(entry.data, "{\"SessionID\":\"A\"}");

    let snap = metrics.snapshot();
    assert_eq!(snap.forward_failures, 1);
    assert_eq!(snap.dlq_writes, 1);
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_recovers_after_probes() {
    let mock = MockHec::start().await;
    mock.set_default_status(500);
    let mut cfg = target(&mock.url());
    cfg.retry = fast_retry(1);
    cfg.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        open_timeout: Duration::from_millis(200),
        half_open_max_calls: 1,
    };
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&cfg, None, metrics.clone()).unwrap();

    for _ in 0..3 {
        let err = client.forward("c", b"{}").await.unwrap_err();
        assert!(matches!(err, HecError::Status { .. }));
    }
    let reached_mock = mock.event_posts().len();
    assert_eq!(reached_mock, 3);

    // Breaker is open: rejected locally, no HTTP call made.
    let err = client.forward("c", b"{}").await.unwrap_err();
    assert!(matches!(err, HecError::CircuitOpen(_)), "{}", err);
    assert_eq!(mock.event_posts().len(), reached_mock);

    // After the open timeout a probe is admitted; two successes close it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    mock.set_default_status(200);
    client.forward("c", b"{\"a\":1}").await.unwrap();
    client.forward("c", b"{\"a\":2}").await.unwrap();
    client.forward("c", b"{\"a\":3}").await.unwrap();
    assert_eq!(mock.event_posts().len(), reached_mock + 3);
}

#[tokio::test]
async fn open_breaker_failure_also_dead_letters() {
    let mock = MockHec::start().await;
    mock.set_default_status(500);
    let dir = tempfile::tempdir().unwrap();
    let dlq = Arc::new(DlqWriter::new(dir.path()).unwrap());
    let mut cfg = target(&mock.url());
    cfg.retry = fast_retry(1);
    cfg.circuit_breaker = CircuitBreakerConfig {
        failure_threshold: 1,
        success_threshold: 1,
        open_timeout: Duration::from_secs(60),
        half_open_max_calls: 1,
    };
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&cfg, Some(dlq.clone()), metrics.clone()).unwrap();

    let _ = client.forward("c1", b"{\"n\":1}").await;
    let err = client.forward("c2", b"{\"n\":2}").await.unwrap_err();
    assert!(matches!(err, HecError::CircuitOpen(_)));

    let contents = std::fs::read_to_string(dlq.current_file().unwrap()).unwrap();
    let entries: Vec<DlqEntry> = contents
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries[1].error.contains("circuit breaker open"));
}

#[tokio::test]
async fn token_reload_applies_to_the_next_delivery() {
    let mock = MockHec::start().await;
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), None, metrics).unwrap();

    client.forward("c", b"{}").await.unwrap();
    client.update_config(
        "rotated-token".to_owned(),
        "zpa:user:activity".to_owned(),
        false,
    );
    client.forward("c", b"{}").await.unwrap();

    let posts = mock.event_posts();
    assert_eq!(posts[0].header("authorization"), Some("Splunk test-token"));
    assert_eq!(
        posts[1].header("authorization"),
        Some("Splunk rotated-token")
    );
}

// ---------------------------------------------------------------------------
// Health checks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_hits_the_health_endpoint() {
    let mock = MockHec::start().await;
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), None, metrics).unwrap();

    client.health_check().await.unwrap();

    let requests = mock.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "GET");
    assert_eq!(requests[0].path, "/services/collector/health");
    assert_eq!(
        requests[0].header("authorization"),
        Some("Splunk test-token")
    );
}

#[tokio::test]
async fn health_check_maps_403_to_invalid_token() {
    let mock = MockHec::start().await;
    mock.set_default_status(403);
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), None, metrics).unwrap();

    let err = client.health_check().await.unwrap_err();
    assert!(matches!(err, HecError::InvalidToken(_)), "{}", err);
}

#[tokio::test]
async fn health_check_reports_other_statuses_verbatim() {
    let mock = MockHec::start().await;
    mock.set_default_status(503);
    let metrics = Arc::new(RelayMetrics::new());
    let client = HecClient::new(&target(&mock.url()), None, metrics).unwrap();

    let err = client.health_check().await.unwrap_err();
    match err {
        HecError::Unhealthy { status_line, .. } => {
            assert!(status_line.contains("503"), "{}", status_line);
        }
        other => panic!("expected Unhealthy, got {}", other),
    }
}
