//! Frame pacing against a target frame rate.
//!
//! A capture cycle is marked when it starts; when the stream asks for the next
//! frame the limiter reports how long to wait so cycles do not run faster than
//! the target rate. The realized rate is logged once per measurement window.

use std::time::{Duration, Instant};

/// Length of the window over which the realized frame rate is averaged.
pub const FPS_MEASURE_PERIOD: Duration = Duration::from_secs(5);

/// Longest pause between cycles, whatever the target rate.
pub const MAX_FRAME_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct FpsLimiter {
    frame_last: Option<Instant>,
    window_start: Option<Instant>,
    window_frames: u64,
    measured: Option<f64>,
}

impl FpsLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a capture cycle.
    pub fn mark_cycle_start(&mut self) {
        self.mark_cycle_start_at(Instant::now());
    }

    pub fn mark_cycle_start_at(&mut self, now: Instant) {
        self.frame_last = Some(now);
    }

    /// Delay to wait before the next cycle so it does not exceed `target_fps`.
    ///
    /// Returns zero when the limit is disabled (`target_fps <= 0`), when no
    /// cycle was marked, or when the previous cycle already took longer than
    /// one frame interval.
    pub fn measure_and_delay(&mut self, target_fps: f64) -> Duration {
        self.measure_and_delay_at(Instant::now(), target_fps)
    }

    pub fn measure_and_delay_at(&mut self, now: Instant, target_fps: f64) -> Duration {
        self.measure_fps(now);

        if !(target_fps > 0.0) || !target_fps.is_finite() {
            return Duration::ZERO;
        }

        let Some(frame_last) = self.frame_last else {
            tracing::trace!("fps limit: no cycle marked yet");
            return Duration::ZERO;
        };

        let elapsed = now.saturating_duration_since(frame_last);
        let target = Duration::try_from_secs_f64(1.0 / target_fps)
            .map_or(MAX_FRAME_INTERVAL, |interval| interval.min(MAX_FRAME_INTERVAL));
        let delay = target.saturating_sub(elapsed);
        if !delay.is_zero() {
            tracing::trace!(
                "fps limit: elapsed {:?}, target {:?}, delaying {:?}",
                elapsed,
                target,
                delay
            );
        }
        delay
    }

    /// Average rate of the last completed measurement window.
    pub fn measured_fps(&self) -> Option<f64> {
        self.measured
    }

    fn measure_fps(&mut self, now: Instant) {
        let Some(window_start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };

        self.window_frames += 1;

        let elapsed = now.saturating_duration_since(window_start);
        if elapsed < FPS_MEASURE_PERIOD {
            return;
        }

        let avg = self.window_frames as f64 / elapsed.as_secs_f64();
        tracing::debug!("fps limit: average over {:?}: {:.2} fps", elapsed, avg);
        self.measured = Some(avg);
        self.window_start = Some(now);
        self.window_frames = 0;
    }
}
