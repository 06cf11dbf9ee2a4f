//! Per-client sliding-window rate limiting
//!
//! Each client identity owns a [`VecDeque`] of request timestamps. The map
//! is behind a read-write lock and every bucket behind its own mutex, so
//! known clients are checked concurrently and only first contact and the
//! cleanup sweep take the map exclusively.

use super::identity::ClientIdentity;
use crate::error::AgentError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Rolling request window of one client
#[derive(Debug)]
pub struct ClientRateState {
    requests: VecDeque<Instant>,
}

impl ClientRateState {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
        }
    }

    /// Evict timestamps that fell out of the window
    fn prune(&mut self, now: Instant, window: Duration) {
        // Nothing can have expired yet when the clock is younger than the window
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while self.requests.front().is_some_and(|&t| t <= cutoff) {
            self.requests.pop_front();
        }
    }

    /// Record the request if the window has room
    fn admit(&mut self, now: Instant, window: Duration, max_requests: u32) -> Result<(), Duration> {
        self.prune(now, window);

        if self.requests.len() as u32 >= max_requests {
            let oldest = self.requests.front().copied().unwrap_or(now);
            let retry_after = window
                .checked_sub(now.duration_since(oldest))
                .unwrap_or(Duration::ZERO);
            return Err(retry_after);
        }

        self.requests.push_back(now);
        Ok(())
    }

    fn is_idle(&self, now: Instant, window: Duration) -> bool {
        match self.requests.back() {
            Some(&last) => now.duration_since(last) >= window,
            None => true,
        }
    }
}

/// Sliding-window limiter keyed by client identity
pub struct RateLimiter {
    /// Requests allowed per window. `0` means unlimited.
    max_requests: u32,
    window: Duration,
    clients: RwLock<HashMap<String, Mutex<ClientRateState>>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_requests` per `window`
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Check and record a request from `client`
    pub async fn check(&self, client: &ClientIdentity) -> Result<(), AgentError> {
        self.check_at(client, Instant::now()).await
    }

    /// Check and record a request from `client` at `now`
    pub async fn check_at(&self, client: &ClientIdentity, now: Instant) -> Result<(), AgentError> {
        if self.max_requests == 0 || self.window.is_zero() {
            return Ok(());
        }

        let admitted = {
            let clients = self.clients.read().await;
            clients.get(client.as_str()).map(|bucket| {
                bucket
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .admit(now, self.window, self.max_requests)
            })
        };

        let admitted = match admitted {
            Some(result) => result,
            None => {
                let mut clients = self.clients.write().await;
                let bucket = clients
                    .entry(client.as_str().to_string())
                    .or_insert_with(|| Mutex::new(ClientRateState::new()));
                bucket
                    .get_mut()
                    .unwrap_or_else(PoisonError::into_inner)
                    .admit(now, self.window, self.max_requests)
            }
        };

        admitted.map_err(|retry_after| AgentError::RateLimited { retry_after })
    }

    /// Drop state of clients with no request inside the last window
    pub async fn cleanup_at(&self, now: Instant) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, bucket| {
            !bucket
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .is_idle(now, self.window)
        });
        before - clients.len()
    }

    /// Number of tracked clients
    pub async fn tracked_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Start the periodic cleanup sweep
    ///
    /// The task ends when `shutdown` flips to `true` or its sender is dropped.
    pub fn start_cleanup(
        self: &Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let limiter = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = limiter.cleanup_at(Instant::now()).await;
                        if evicted > 0 {
                            debug!(evicted, "rate limiter evicted idle clients");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("rate limiter cleanup stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(name: &str) -> ClientIdentity {
        ClientIdentity::derive("test", name, "")
    }

    #[tokio::test]
    async fn test_n_plus_one_rejected_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let alice = client("alice");
        let t0 = Instant::now();

        for i in 0..3 {
            limiter
                .check_at(&alice, t0 + Duration::from_millis(i))
                .await
                .expect("within threshold");
        }

        let err = limiter
            .check_at(&alice, t0 + Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            AgentError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(9));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_allowed_again_after_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let alice = client("alice");
        let t0 = Instant::now();

        limiter.check_at(&alice, t0).await.unwrap();
        limiter.check_at(&alice, t0).await.unwrap();
        assert!(limiter.check_at(&alice, t0 + Duration::from_secs(5)).await.is_err());

        assert!(limiter
            .check_at(&alice, t0 + Duration::from_secs(10))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_clients_are_bucketed_separately() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let t0 = Instant::now();

        limiter.check_at(&client("alice"), t0).await.unwrap();
        assert!(limiter.check_at(&client("alice"), t0).await.is_err());
        assert!(limiter.check_at(&client("bob"), t0).await.is_ok());
    }

    #[tokio::test]
    async fn test_zero_means_unlimited() {
        let limiter = RateLimiter::new(0, Duration::from_secs(60));
        let alice = client("alice");
        for _ in 0..100 {
            limiter.check(&alice).await.unwrap();
        }
        assert_eq!(limiter.tracked_clients().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_evicts_idle_clients() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        let t0 = Instant::now();

        limiter.check_at(&client("old"), t0).await.unwrap();
        limiter
            .check_at(&client("recent"), t0 + Duration::from_secs(8))
            .await
            .unwrap();
        assert_eq!(limiter.tracked_clients().await, 2);

        let evicted = limiter.cleanup_at(t0 + Duration::from_secs(12)).await;
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_clients().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_shutdown() {
        let limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(10)));
        let (tx, rx) = watch::channel(false);
        let handle = limiter.start_cleanup(Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cleanup task did not stop")
            .unwrap();
    }
}
