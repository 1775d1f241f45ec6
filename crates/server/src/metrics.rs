//! Process-wide counters exposed at `GET /metrics` in Prometheus text
//! exposition format. Hand-rolled as a handful of `AtomicU64`s formatted
//! by hand rather than pulled from a metrics registry crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    started_at: Instant,
    ws_opened: AtomicU64,
    ws_closed: AtomicU64,
    ssh_connect_failures: AtomicU64,
    ssrf_rejections: AtomicU64,
    throttle_trips: AtomicU64,
    turnstile_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ws_opened: AtomicU64::new(0),
            ws_closed: AtomicU64::new(0),
            ssh_connect_failures: AtomicU64::new(0),
            ssrf_rejections: AtomicU64::new(0),
            throttle_trips: AtomicU64::new(0),
            turnstile_failures: AtomicU64::new(0),
        }
    }

    pub fn ws_opened(&self) {
        self.ws_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ws_closed(&self) {
        self.ws_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ssh_connect_failure(&self) {
        self.ssh_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ssrf_rejection(&self) {
        self.ssrf_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn throttle_trip(&self) {
        self.throttle_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turnstile_failure(&self) {
        self.turnstile_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Render as `text/plain; version=0.0.4` Prometheus exposition text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let gauge = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        };

        gauge(
            &mut out,
            "gateway_ws_opened_total",
            "WebSocket upgrades accepted into the relay",
            self.ws_opened.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gateway_ws_closed_total",
            "Relay connections torn down",
            self.ws_closed.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gateway_ssh_connect_failures_total",
            "SSH dial or authentication failures",
            self.ssh_connect_failures.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gateway_ssrf_rejections_total",
            "Connect targets rejected by the host guard",
            self.ssrf_rejections.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gateway_throttle_trips_total",
            "Connect attempts rejected by per-user SSH throttling",
            self.throttle_trips.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gateway_turnstile_failures_total",
            "Challenge verification failures",
            self.turnstile_failures.load(Ordering::Relaxed),
        );
        out.push_str("# HELP gateway_uptime_seconds Seconds since process start\n");
        out.push_str("# TYPE gateway_uptime_seconds gauge\n");
        out.push_str(&format!("gateway_uptime_seconds {}\n", self.uptime_seconds()));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_all_counters() {
        let m = Metrics::new();
        m.ws_opened();
        m.ws_closed();
        m.ssrf_rejection();
        let text = m.render();
        assert!(text.contains("gateway_ws_opened_total 1"));
        assert!(text.contains("gateway_ws_closed_total 1"));
        assert!(text.contains("gateway_ssrf_rejections_total 1"));
        assert!(text.contains("gateway_ssh_connect_failures_total 0"));
        assert!(text.contains("gateway_uptime_seconds"));
    }
}
