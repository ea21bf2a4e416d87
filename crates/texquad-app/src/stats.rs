// SPDX-License-Identifier: CEPL-1.0
use std::time::{Duration, Instant};

use texquad_render::RenderStatus;

const REPORT_EVERY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsReport {
    pub fps: f64,
    pub latest_ms: f64,
    pub mean_ms: f64,
    pub total: u64,
}

/// Frame time bookkeeping for the redraw loop.
#[derive(Debug)]
pub struct FrameStats {
    last_frame: Option<Instant>,
    last_report: Instant,
    latest: Duration,
    // running mean over `samples` frame deltas
    mean_secs: f64,
    samples: u64,
    total: u64,
    since_report: u64,
}

impl FrameStats {
    pub fn new(now: Instant) -> Self {
        FrameStats {
            last_frame: None,
            last_report: now,
            latest: Duration::ZERO,
            mean_secs: 0.0,
            samples: 0,
            total: 0,
            since_report: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.mean_secs)
    }

    /// Counts one presented frame. Returns a report at most once per second.
    pub fn tick(&mut self, now: Instant) -> Option<StatsReport> {
        if let Some(prev) = self.last_frame {
            self.latest = now.saturating_duration_since(prev);
            self.samples += 1;
            self.mean_secs += (self.latest.as_secs_f64() - self.mean_secs) / self.samples as f64;
        }
        self.last_frame = Some(now);
        self.total += 1;
        self.since_report += 1;

        let window = now.saturating_duration_since(self.last_report);
        if window < REPORT_EVERY {
            return None;
        }
        let report = StatsReport {
            fps: self.since_report as f64 / window.as_secs_f64(),
            latest_ms: self.latest.as_secs_f64() * 1e3,
            mean_ms: self.mean_secs * 1e3,
            total: self.total,
        };
        self.since_report = 0;
        self.last_report = now;
        Some(report)
    }

    /// Only presented frames count; a pause also drops the pending delta.
    pub fn record(&mut self, status: RenderStatus, now: Instant) -> Option<StatsReport> {
        match status {
            RenderStatus::Presented => self.tick(now),
            RenderStatus::Skipped => None,
            RenderStatus::Paused => {
                self.pause();
                None
            }
        }
    }

    /// Forget the previous frame so a pause is not counted as one long frame.
    pub fn pause(&mut self) {
        self.last_frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn mean_is_incremental_over_deltas() {
        let t0 = Instant::now();
        let mut s = FrameStats::new(t0);
        s.tick(t0);
        s.tick(t0 + ms(10));
        s.tick(t0 + ms(40));
        // deltas 10ms and 30ms
        assert_eq!(s.total(), 3);
        assert!((s.mean().as_secs_f64() - 0.020).abs() < 1e-9);
    }

    #[test]
    fn reports_once_per_second() {
        let t0 = Instant::now();
        let mut s = FrameStats::new(t0);
        for i in 0..60 {
            assert!(s.tick(t0 + ms(i * 16)).is_none());
        }
        let r = s.tick(t0 + ms(1000)).expect("report after a second");
        assert_eq!(r.total, 61);
        assert!((r.fps - 61.0).abs() < 1e-9);
        assert!((r.latest_ms - 56.0).abs() < 1e-6);

        // counter restarts after a report
        assert!(s.tick(t0 + ms(1010)).is_none());
        let r = s.tick(t0 + ms(2000)).expect("second report");
        assert!((r.fps - 2.0).abs() < 1e-9);
        assert_eq!(r.total, 63);
    }

    #[test]
    fn pause_skips_the_gap() {
        let t0 = Instant::now();
        let mut s = FrameStats::new(t0);
        s.tick(t0);
        s.tick(t0 + ms(10));
        s.pause();
        s.tick(t0 + ms(5000));
        s.tick(t0 + ms(5010));
        assert!((s.mean().as_secs_f64() - 0.010).abs() < 1e-9);
        assert_eq!(s.total(), 4);
    }

    #[test]
    fn paused_and_skipped_calls_are_not_frames() {
        let t0 = Instant::now();
        let mut s = FrameStats::new(t0);
        s.record(RenderStatus::Presented, t0);
        s.record(RenderStatus::Presented, t0 + ms(10));

        // a paused renderer returns at once; none of these may count
        for i in 0..10_000u64 {
            let now = t0 + ms(10) + Duration::from_micros(i * 100);
            assert!(s.record(RenderStatus::Paused, now).is_none());
        }
        assert!(s.record(RenderStatus::Skipped, t0 + ms(1500)).is_none());
        assert_eq!(s.total(), 2);

        // first frame after the pause reports a sane rate, not the spin rate
        let r = s
            .record(RenderStatus::Presented, t0 + ms(2000))
            .expect("report after a second");
        assert_eq!(r.total, 3);
        assert!((r.fps - 1.5).abs() < 1e-9, "fps {}", r.fps);
        assert!((s.mean().as_secs_f64() - 0.010).abs() < 1e-9);
    }
}
