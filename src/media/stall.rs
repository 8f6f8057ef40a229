//! Playback stall detection.
//!
//! The playback element offers no reliable "stalled" signal, so the monitor
//! is deliberately a recurring poll rather than a push subscription: every
//! tick it samples the playback position and, once the position has been
//! frozen for the stall threshold while actually playing, it halts the
//! stream so the UI is never left hanging on a dead source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Playback element boundary polled by the monitor.
#[async_trait]
pub trait PlaybackProbe: Send + Sync {
    /// Current playback position in seconds.
    async fn position(&self) -> f64;

    /// True only when there is an active source and playback is not paused.
    async fn is_playing(&self) -> bool;

    /// Tear the stream down: pause playback and clear the source.
    async fn halt(&self);
}

#[derive(Debug, Clone)]
pub struct StallConfig {
    pub poll_interval: Duration,
    /// Zero position advance for at least this long, while playing, is a stall.
    pub stall_after: Duration,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            stall_after: Duration::from_secs(3),
        }
    }
}

/// Recurring stall check over one playback surface.
pub struct StallMonitor {
    handle: JoinHandle<()>,
}

impl StallMonitor {
    /// Spawn the monitor. It halts the playback and stops itself on the
    /// first detected stall; dropping the monitor aborts it.
    pub fn spawn(probe: Arc<dyn PlaybackProbe>, config: StallConfig) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; use it to take a baseline.
            ticker.tick().await;

            let mut last_position = f64::NEG_INFINITY;
            let mut frozen_for = Duration::ZERO;

            loop {
                ticker.tick().await;

                if !probe.is_playing().await {
                    // Paused or no active source: hold, never fire.
                    frozen_for = Duration::ZERO;
                    continue;
                }

                let position = probe.position().await;
                if position != last_position {
                    last_position = position;
                    frozen_for = Duration::ZERO;
                    continue;
                }

                frozen_for += config.poll_interval;
                if frozen_for >= config.stall_after {
                    warn!(
                        "playback stalled at {position:.2}s for {:?}; halting stream",
                        frozen_for
                    );
                    probe.halt().await;
                    break;
                }
            }
            debug!("stall monitor finished");
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for StallMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakePlayback {
        position: StdMutex<f64>,
        playing: StdMutex<bool>,
        halted: StdMutex<bool>,
    }

    #[async_trait]
    impl PlaybackProbe for FakePlayback {
        async fn position(&self) -> f64 {
            *self.position.lock().unwrap()
        }

        async fn is_playing(&self) -> bool {
            *self.playing.lock().unwrap()
        }

        async fn halt(&self) {
            *self.halted.lock().unwrap() = true;
            *self.playing.lock().unwrap() = false;
        }
    }

    fn playing_probe() -> Arc<FakePlayback> {
        let probe = FakePlayback::default();
        *probe.playing.lock().unwrap() = true;
        Arc::new(probe)
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_position_halts_after_threshold() {
        let probe = playing_probe();
        let _monitor = StallMonitor::spawn(probe.clone(), StallConfig::default());

        advance(Duration::from_millis(2900)).await;
        assert!(!*probe.halted.lock().unwrap());

        advance(Duration::from_millis(1100)).await;
        assert!(*probe.halted.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_advancing_position_never_fires() {
        let probe = playing_probe();
        let _monitor = StallMonitor::spawn(probe.clone(), StallConfig::default());

        for _ in 0..20 {
            advance(Duration::from_millis(500)).await;
            *probe.position.lock().unwrap() += 0.5;
        }
        assert!(!*probe.halted.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_playback_never_fires() {
        let probe = Arc::new(FakePlayback::default());
        let _monitor = StallMonitor::spawn(probe.clone(), StallConfig::default());

        advance(Duration::from_secs(10)).await;
        assert!(!*probe.halted.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resets_the_stall_clock() {
        let probe = playing_probe();
        let _monitor = StallMonitor::spawn(probe.clone(), StallConfig::default());

        // Frozen just under the threshold, then paused: the clock resets.
        advance(Duration::from_millis(2500)).await;
        *probe.playing.lock().unwrap() = false;
        advance(Duration::from_millis(1000)).await;
        *probe.playing.lock().unwrap() = true;
        advance(Duration::from_millis(2500)).await;
        assert!(!*probe.halted.lock().unwrap());

        advance(Duration::from_millis(1000)).await;
        assert!(*probe.halted.lock().unwrap());
    }
}
