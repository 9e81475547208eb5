use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

/// Caps outbound requests per second. Permits are consumed, never returned,
/// and the pool is topped back up once per second.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    refill: JoinHandle<()>,
}

impl RateLimiter {
    pub fn new(per_second: usize) -> Self {
        let permits = Arc::new(Semaphore::new(per_second));

        let permits_c = permits.clone();
        let refill = tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let available = permits_c.available_permits();
                permits_c.add_permits(per_second.saturating_sub(available));
            }
        });

        Self { permits, refill }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.refill.abort();
    }
}
