//! Three-state circuit breaker gating forwarder calls.
//!
//! CLOSED executes calls and counts consecutive failures; at
//! `failure_threshold` the breaker OPENs and rejects calls without invoking
//! them. After `open_timeout` the breaker admits up to
//! `half_open_max_calls` concurrent probes (HALF_OPEN); `success_threshold`
//! consecutive probe successes close it again, any probe failure re-opens
//! it and restarts the timer.
//!
//! A `failure_threshold` of 0 disables the breaker entirely.
//!
//! State is mutated only inside short critical sections; the protected
//! call itself runs outside the state lock so it may block. The half-open
//! in-flight count lives in its own atomic so probe slot accounting never
//! contends with state reads.

use crate::config::CircuitBreakerConfig;
use std::future::Future;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Error wrapper returned by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without invoking it.
    Open,
    /// The protected call ran and failed.
    Inner(E),
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerError::Open => write!(f, "circuit breaker open"),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

struct State {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition: Instant,
}

/// What kind of admission a call received; determines bookkeeping on
/// completion.
enum Permit {
    /// Breaker disabled (threshold 0): no accounting at all.
    Unguarded,
    /// Normal CLOSED-state call.
    Closed,
    /// HALF_OPEN probe holding one of the limited slots.
    Probe,
}

pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: Mutex<State>,
    half_open_in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            cfg,
            state: Mutex::new(State {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_transition: Instant::now(),
            }),
            half_open_in_flight: AtomicU32::new(0),
        }
    }

    /// Run `op` under the breaker.
    ///
    /// Returns `BreakerError::Open` without invoking `op` when the breaker
    /// rejects the call.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().ok_or(BreakerError::Open)?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(&permit),
            Err(_) => self.on_failure(&permit),
        }
        if matches!(permit, Permit::Probe) {
            self.half_open_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
        result.map_err(BreakerError::Inner)
    }

    /// Current state, after applying the open→half-open timer check.
    pub fn state(&self) -> CircuitState {
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        state.state
    }

    fn try_acquire(&self) -> Option<Permit> {
        if self.cfg.failure_threshold == 0 {
            return Some(Permit::Unguarded);
        }
        let mut state = self.lock();
        self.maybe_half_open(&mut state);
        match state.state {
            CircuitState::Closed => Some(Permit::Closed),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                // Claim a probe slot; losers are rejected like OPEN.
                let max = self.cfg.half_open_max_calls;
                let claimed = self
                    .half_open_in_flight
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        if n < max { Some(n + 1) } else { None }
                    })
                    .is_ok();
                if claimed { Some(Permit::Probe) } else { None }
            }
        }
    }

    fn maybe_half_open(&self, state: &mut State) {
        if state.state == CircuitState::Open
            && state.last_transition.elapsed() >= self.cfg.open_timeout
        {
            state.state = CircuitState::HalfOpen;
            state.consecutive_successes = 0;
            state.last_transition = Instant::now();
        }
    }

    fn on_success(&self, permit: &Permit) {
        if matches!(permit, Permit::Unguarded) {
            return;
        }
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.cfg.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.last_transition = Instant::now();
                }
            }
            // A probe that outlived a half-open→open transition.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, permit: &Permit) {
        if matches!(permit, Permit::Unguarded) {
            return;
        }
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.cfg.failure_threshold {
                    state.state = CircuitState::Open;
                    state.last_transition = Instant::now();
                }
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.consecutive_successes = 0;
                state.last_transition = Instant::now();
            }
            CircuitState::Open => {
                // Stale probe failure; the timer was already reset.
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cfg(threshold: u32, success: u32, open_ms: u64, probes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: success,
            open_timeout: Duration::from_millis(open_ms),
            half_open_max_calls: probes,
        }
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let b = CircuitBreaker::new(cfg(3, 1, 10_000, 1));
        for _ in 0..3 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(fail(&b).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn success_resets_the_failure_count() {
        let b = CircuitBreaker::new(cfg(3, 1, 10_000, 1));
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        succeed(&b).await.unwrap();
        for _ in 0..2 {
            let _ = fail(&b).await;
        }
        // Two failures after a success: still closed.
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn open_rejects_without_invoking() {
        let b = CircuitBreaker::new(cfg(1, 1, 10_000, 1));
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let result = b
            .call(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open)));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recovers_through_half_open_probes() {
        // Mirrors the threshold-3 / 200 ms / success-2 recovery scenario.
        let b = CircuitBreaker::new(cfg(3, 2, 200, 1));
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        assert!(matches!(fail(&b).await, Err(BreakerError::Open)));

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }

    #[tokio::test]
    async fn probe_failure_reopens_and_restarts_timer() {
        let b = CircuitBreaker::new(cfg(1, 1, 100, 1));
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        // Timer restarted: still open well before a fresh 100 ms elapses.
        assert!(matches!(fail(&b).await, Err(BreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_admits_at_most_max_concurrent_probes() {
        let b = Arc::new(CircuitBreaker::new(cfg(1, 2, 50, 2)));
        let _ = fail(&b).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        // Two probes park on a channel; a third call must be rejected.
        let (release_tx, _) = tokio::sync::watch::channel(false);
        let mut handles = Vec::new();
        for _ in 0..2 {
            let b = b.clone();
            let mut release = release_tx.subscribe();
            handles.push(tokio::spawn(async move {
                b.call(|| async move {
                    let _ = release.changed().await;
                    Ok::<_, &'static str>(())
                })
                .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open)));

        release_tx.send(true).unwrap();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn zero_threshold_disables_the_breaker() {
        let b = CircuitBreaker::new(cfg(0, 1, 10, 1));
        for _ in 0..50 {
            assert!(matches!(fail(&b).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }
}
