use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::zulip::event_queue::SubscriptionStatus;

static DISCORD_TO_ZULIP_RELAYED: AtomicU64 = AtomicU64::new(0);
static ZULIP_TO_DISCORD_RELAYED: AtomicU64 = AtomicU64::new(0);
static RELAY_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Process-wide relay counters.
pub struct Metrics;

impl Metrics {
    pub fn discord_message_relayed() {
        DISCORD_TO_ZULIP_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn zulip_message_relayed() {
        ZULIP_TO_DISCORD_RELAYED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_failed() {
        RELAY_FAILURES.fetch_add(1, Ordering::Relaxed);
    }
}

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = write!(
        out,
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n"
    );
}

pub fn format_prometheus(uptime_secs: u64, subscription: Option<&SubscriptionStatus>) -> String {
    let mut out = String::new();
    metric(
        &mut out,
        "bridge_uptime_seconds",
        "gauge",
        "Number of seconds the bridge has been running",
        uptime_secs,
    );
    metric(
        &mut out,
        "discord_to_zulip_messages_total",
        "counter",
        "Discord messages relayed to Zulip",
        DISCORD_TO_ZULIP_RELAYED.load(Ordering::Relaxed),
    );
    metric(
        &mut out,
        "zulip_to_discord_messages_total",
        "counter",
        "Zulip messages relayed to Discord",
        ZULIP_TO_DISCORD_RELAYED.load(Ordering::Relaxed),
    );
    metric(
        &mut out,
        "relay_failures_total",
        "counter",
        "Relay attempts that failed",
        RELAY_FAILURES.load(Ordering::Relaxed),
    );
    if let Some(status) = subscription {
        metric(
            &mut out,
            "zulip_events_received_total",
            "counter",
            "Zulip queue events received",
            status.events_received,
        );
        metric(
            &mut out,
            "zulip_poll_errors_total",
            "counter",
            "Failed event queue polls",
            status.poll_errors,
        );
        metric(
            &mut out,
            "zulip_queue_reregistrations_total",
            "counter",
            "Event queue re-registrations after expiry",
            status.reregistrations,
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{Metrics, RELAY_FAILURES, format_prometheus};
    use crate::zulip::event_queue::SubscriptionStatus;

    #[test]
    fn counters_only_grow() {
        let before = RELAY_FAILURES.load(Ordering::Relaxed);
        Metrics::relay_failed();
        assert!(RELAY_FAILURES.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn exposition_includes_subscription_counters() {
        let status = SubscriptionStatus {
            events_received: 9,
            poll_errors: 3,
            reregistrations: 1,
            ..Default::default()
        };

        let output = format_prometheus(12, Some(&status));

        assert!(output.contains("bridge_uptime_seconds 12\n"));
        assert!(output.contains("relay_failures_total"));
        assert!(output.contains("zulip_events_received_total 9\n"));
        assert!(output.contains("zulip_poll_errors_total 3\n"));
        assert!(output.contains("zulip_queue_reregistrations_total 1\n"));
        assert!(!format_prometheus(0, None).contains("zulip_poll_errors_total"));
    }
}
