/// Fixed-interval poll scheduler
/// One tick per interval, first tick immediately; cycles never overlap because
/// the caller awaits each cycle before asking for the next tick.

use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shortest accepted interval; zero would spin.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct Schedule {
    ticker: Interval,
    cancel: CancellationToken,
}

impl Schedule {
    pub fn new(period: Duration, cancel: CancellationToken) -> Self {
        let period = period.max(MIN_INTERVAL);
        let mut ticker = interval(period);
        // A cycle that overran its slot pushes the next one back instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Scheduler started (every {})", format_duration(period));
        Self { ticker, cancel }
    }

    pub fn period(&self) -> Duration {
        self.ticker.period()
    }

    /// Wait for the next tick. Returns false once shutdown was requested.
    pub async fn tick(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Scheduler stopping");
                false
            }
            _ = self.ticker.tick() => true,
        }
    }
}

/// Format duration for logging
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let rest = secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 && rest > 0 {
        format!("{}m {}s", mins, rest)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", rest)
    }
}
