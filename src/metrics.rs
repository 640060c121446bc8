//! Throughput counters and the periodic stdout reporter.
//!
//! All counters are monotonic and mutated only by the owning event loop.
//! The status line is the product surface: it goes to stdout, re-printed
//! in place (carriage return) at most once per second. Diagnostics use
//! tracing and go to stderr.

use std::io::{self, Write};
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counters for one engine run.
#[derive(Debug)]
pub struct Metrics {
    /// Total bytes received (sum of successful receive sizes).
    pub bytes: u64,
    /// Successful receives.
    pub messages: u64,
    pub conns_accepted: u64,
    pub conns_closed: u64,
    started: Instant,
    last_report: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            bytes: 0,
            messages: 0,
            conns_accepted: 0,
            conns_closed: 0,
            started: now,
            last_report: now,
        }
    }

    pub fn on_accept(&mut self) {
        self.conns_accepted += 1;
    }

    pub fn on_close(&mut self) {
        self.conns_closed += 1;
    }

    /// Record one successful receive of `n` bytes.
    pub fn on_message(&mut self, n: usize) {
        self.bytes += n as u64;
        self.messages += 1;
    }

    /// Re-print the status line in place, at most once per second unless
    /// `force` is set.
    pub fn report(&mut self, force: bool) {
        if !force && !self.due() {
            return;
        }
        self.last_report = Instant::now();
        print!("{}\r", self.status_line());
        let _ = io::stdout().flush();
    }

    /// Shutdown summary: step off the in-place line, then one forced report.
    pub fn final_report(&self) {
        println!();
        println!("{}", self.status_line());
    }

    fn due(&self) -> bool {
        self.last_report.elapsed() >= REPORT_INTERVAL
    }

    fn status_line(&self) -> String {
        self.status_line_at(self.started.elapsed().as_secs_f64())
    }

    fn status_line_at(&self, elapsed: f64) -> String {
        let elapsed = elapsed.max(1e-9);
        let active = self.conns_accepted.saturating_sub(self.conns_closed);
        let rate = self.messages as f64 / elapsed;
        let mbits = self.bytes as f64 * 8.0 / elapsed / 1e6;
        let mbytes = self.bytes as f64 / elapsed / 1e6;
        let mib = self.bytes as f64 / (1024.0 * 1024.0);
        format!(
            "{elapsed:7.1}s  active {active:5}  accepted {:8}  msgs {:10}  \
             {rate:10.0} msg/s  {mbits:8.2} Mb/s {mbytes:7.2} MB/s  total {mib:8.1} MiB",
            self.conns_accepted, self.messages
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_advance() {
        let mut m = Metrics::new();
        m.on_accept();
        m.on_message(128);
        m.on_message(64);
        m.on_close();

        assert_eq!(m.conns_accepted, 1);
        assert_eq!(m.conns_closed, 1);
        assert_eq!(m.messages, 2);
        assert_eq!(m.bytes, 192);
    }

    #[test]
    fn status_line_rates() {
        let mut m = Metrics::new();
        m.conns_accepted = 2;
        m.conns_closed = 1;
        m.messages = 1000;
        m.bytes = 2 * 1024 * 1024;

        let line = m.status_line_at(2.0);
        assert!(line.contains("500 msg/s"), "{line}");
        assert!(line.contains("8.39 Mb/s"), "{line}");
        assert!(line.contains("2.0 MiB"), "{line}");
        assert!(line.contains("active     1"), "{line}");
    }

    #[test]
    fn status_line_survives_zero_elapsed() {
        let m = Metrics::new();
        let line = m.status_line_at(0.0);
        assert!(line.contains("msg/s"), "{line}");
    }

    #[test]
    fn report_is_rate_limited() {
        let m = Metrics::new();
        assert!(!m.due());
    }
}
