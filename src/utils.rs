//! Clock seam, poll metrics, and formatting helpers

use chrono::Utc;
use log::debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Injected wall-clock time
///
/// The discovery procedure and the service log need Unix timestamps; taking
/// them through a trait keeps the time source out of the control logic and
/// lets the test harnesses run discovery without waiting wall-clock hours.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now_unix(&self) -> i64;
}

/// The real wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A hand-driven clock for tests and simulators
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self { now: AtomicI64::new(start) }
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Outcome counters for the station poll loop
#[derive(Debug, Clone, Default)]
pub struct PollMetrics {
    pub cycles: u64,
    pub device_polls: u64,
    pub poll_failures: u64,
    pub total_duration: Duration,
    pub max_cycle: Option<Duration>,
}

impl PollMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed poll cycle
    pub fn record_cycle(&mut self, duration: Duration, polls: u64, failures: u64) {
        self.cycles += 1;
        self.device_polls += polls;
        self.poll_failures += failures;
        self.total_duration += duration;
        self.max_cycle = Some(self.max_cycle.map_or(duration, |m| m.max(duration)));
    }

    /// Fraction of device polls that succeeded
    pub fn success_rate(&self) -> f64 {
        if self.device_polls == 0 {
            return 1.0;
        }
        (self.device_polls - self.poll_failures) as f64 / self.device_polls as f64
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer and return the elapsed duration
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        debug!("{} took {:?}", self.operation_name, duration);
        duration
    }
}

/// Formatting helpers for frame-level debug logs
pub mod format {
    /// Format a byte slice as spaced hex pairs
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format register words as spaced hex quads
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_614_319_283);
        clock.advance(10);
        assert_eq!(clock.now_unix(), 1_614_319_293);
        clock.set(0);
        assert_eq!(clock.now_unix(), 0);
    }

    #[test]
    fn test_poll_metrics() {
        let mut m = PollMetrics::new();
        m.record_cycle(Duration::from_millis(900), 25, 1);
        m.record_cycle(Duration::from_millis(400), 25, 0);
        assert_eq!(m.cycles, 2);
        assert_eq!(m.device_polls, 50);
        assert!((m.success_rate() - 0.98).abs() < 1e-9);
        assert_eq!(m.max_cycle, Some(Duration::from_millis(900)));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::bytes_to_hex(&[0x01, 0x03, 0xF4]), "01 03 F4");
        assert_eq!(format::registers_to_hex(&[0x1234, 0x0001]), "1234 0001");
    }
}
