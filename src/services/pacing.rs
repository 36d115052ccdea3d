use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::config::{PacingKind, Settings};

/// What happened to the item the runner just finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemOutcome {
    Graded,
    Degraded,
    RateLimited,
}

/// Decides how long the batch runner waits after each student item.
#[async_trait]
pub(crate) trait Pacer: Send + Sync {
    fn delay_after(&self, outcome: ItemOutcome) -> Duration;

    async fn pause(&self, outcome: ItemOutcome) {
        let delay = self.delay_after(outcome);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FixedDelay(pub(crate) Duration);

impl Pacer for FixedDelay {
    fn delay_after(&self, _outcome: ItemOutcome) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NoDelay;

impl Pacer for NoDelay {
    fn delay_after(&self, _outcome: ItemOutcome) -> Duration {
        Duration::ZERO
    }
}

/// Waits `base` between items, doubling (up to `max`) after each rate-limited
/// item and dropping back to `base` after a successful one.
#[derive(Debug)]
pub(crate) struct AdaptiveBackoff {
    base: Duration,
    max: Duration,
    current_ms: AtomicU64,
}

impl AdaptiveBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self { base, max, current_ms: AtomicU64::new(millis(base)) }
    }
}

impl Pacer for AdaptiveBackoff {
    fn delay_after(&self, outcome: ItemOutcome) -> Duration {
        let base = millis(self.base);
        let next = match outcome {
            ItemOutcome::RateLimited => {
                let current = self.current_ms.load(Ordering::Relaxed).max(base).max(1);
                current.saturating_mul(2).min(millis(self.max))
            }
            ItemOutcome::Graded => base,
            ItemOutcome::Degraded => self.current_ms.load(Ordering::Relaxed),
        };
        self.current_ms.store(next, Ordering::Relaxed);
        Duration::from_millis(next)
    }
}

pub(crate) fn from_settings(settings: &Settings) -> Arc<dyn Pacer> {
    let grading = settings.grading();
    let base = Duration::from_millis(grading.delay_ms);
    match grading.pacing {
        PacingKind::Fixed => Arc::new(FixedDelay(base)),
        PacingKind::Adaptive => {
            Arc::new(AdaptiveBackoff::new(base, Duration::from_millis(grading.max_delay_ms)))
        }
        PacingKind::None => Arc::new(NoDelay),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
