//! Simulation context implementing ColocateContext for deterministic testing.

use async_trait::async_trait;
use colocate_env::ColocateContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use tracing::debug;

/// Simulation context backed by the tokio virtual clock and a seeded RNG.
///
/// This implements `ColocateContext` using:
/// - Tokio's clock, which the harness runs paused so that time only moves
///   when every task is blocked (or when [`advance_time`](Self::advance_time)
///   is called)
/// - A seeded ChaCha8 RNG from which every other random stream is derived
///
/// The core reads `tokio::time` directly for its timeouts and polling
/// intervals, so sharing tokio's clock keeps the context and the core on one
/// timeline.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Virtual time zero
    start: Instant,

    /// Deterministic RNG for derived streams
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            start: Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration, firing due timers.
    ///
    /// # Panics
    /// If the tokio clock is not paused.
    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.now().as_nanos() as u64
    }

    /// Draws the next value from the master stream.
    pub fn next_u64(&self) -> u64 {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).gen()
    }

    /// Derives an independent seed for a named stream (network, scene, ...).
    pub fn derive_seed(&self, stream: u64) -> u64 {
        self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            start: self.start,
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl ColocateContext for SimContext {
    fn now(&self) -> Duration {
        Instant::now().duration_since(self.start)
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        let at = self.now();
        tokio::spawn(async move {
            future.await;
            debug!(task = %name, spawned_at = ?at, "sim task finished");
        });
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1)).await;
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500)).await;
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.time_ns(), 1_500_000_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_sleep_moves_virtual_clock() {
        let ctx = SimContext::new(42);
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.now(), Duration::from_secs(30));
        assert_eq!(ctx.system_time(), UNIX_EPOCH + Duration::from_secs(1704067200 + 30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_streams_are_deterministic() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        assert_eq!(ctx1.next_u64(), ctx2.next_u64());
        assert_eq!(ctx1.derive_seed(1), ctx2.derive_seed(1));
        assert_ne!(ctx1.derive_seed(1), ctx1.derive_seed(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5)).await;

        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(ctx2.seed(), 42);
    }
}
