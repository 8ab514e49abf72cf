use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{Watch, WatchConfig, Watcher};

/// Interval used when none (or zero) is configured.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub struct TimerWatchConfig {
    pub interval: Duration,
    pub watch: WatchConfig,
}

/// Emits an increasing tick number every `interval`.
///
/// Ticks that could not be produced on time are skipped, never replayed, and
/// nothing is emitted once the stop signal has been observed.
#[derive(Debug)]
pub struct TimerWatch {
    interval: Duration,
    watch: Watch<u64>,
}

impl TimerWatch {
    pub fn new(name: impl Into<Arc<str>>, config: TimerWatchConfig) -> Self {
        Self {
            interval: effective_interval(config.interval),
            watch: Watch::new(name, config.watch),
        }
    }

    /// Like [`new`](Self::new), but stopped by `token` and drained by `tracker`.
    pub fn attached(
        name: impl Into<Arc<str>>,
        config: TimerWatchConfig,
        token: &CancellationToken,
        tracker: &TaskTracker,
    ) -> Self {
        Self {
            interval: effective_interval(config.interval),
            watch: Watch::attached(name, config.watch, token, tracker),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn effective_interval(interval: Duration) -> Duration {
    if interval.is_zero() {
        log::trace!("[TimerWatch] Using default interval of one second since none was provided.");
        DEFAULT_INTERVAL
    } else {
        interval
    }
}

impl Watcher for TimerWatch {
    type Sample = u64;

    fn watch(&self) -> &Watch<u64> {
        &self.watch
    }

    fn on_start(&self) {
        self.watch
            .spawn(timer_loop(self.watch.clone(), self.interval));
    }
}

async fn timer_loop(watch: Watch<u64>, period: Duration) {
    let stop = watch.stop_token();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut seq = 0;
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                // stop wins over a tick that became ready at the same time
                if stop.is_cancelled() {
                    break;
                }
                seq += 1;
                watch.emit(seq).await;
            }
        }
    }
    log::debug!("Timer `{}` exited after {} ticks", watch.name(), seq);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::WatcherState;

    fn drain(sub: &mut crate::watch::Subscription<u64>) -> Vec<u64> {
        std::iter::from_fn(|| sub.try_recv()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_k_ticks_in_k_and_a_half_intervals() {
        for (millis, k) in [(100u64, 3u32), (250, 5), (1000, 1)] {
            let period = Duration::from_millis(millis);
            let timer = TimerWatch::new(
                "timer",
                TimerWatchConfig {
                    interval: period,
                    ..Default::default()
                },
            );
            let mut sub = timer.subscribe();
            timer.start();

            tokio::time::sleep(period * k + period / 2).await;
            timer.stop();

            let ticks = drain(&mut sub);
            assert_eq!(ticks, (1..=u64::from(k)).collect::<Vec<_>>());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_emitted_after_stop() {
        let period = Duration::from_millis(50);
        let timer = TimerWatch::new(
            "timer",
            TimerWatchConfig {
                interval: period,
                ..Default::default()
            },
        );
        let mut sub = timer.subscribe();
        timer.start();
        tokio::time::sleep(period * 2 + period / 2).await;
        timer.stop();
        assert_eq!(timer.state(), WatcherState::Stopped);

        tokio::time::sleep(period * 10).await;
        assert_eq!(drain(&mut sub), vec![1, 2]);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_ends_loop() {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let timer = TimerWatch::attached(
            "timer",
            TimerWatchConfig {
                interval: Duration::from_millis(10),
                ..Default::default()
            },
            &token,
            &tracker,
        );
        let mut sub = timer.subscribe();
        timer.start();
        assert_eq!(sub.recv().await, Some(1));

        token.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_zero_interval_uses_default() {
        let timer = TimerWatch::new("timer", TimerWatchConfig::default());
        assert_eq!(timer.interval(), DEFAULT_INTERVAL);
    }
}
