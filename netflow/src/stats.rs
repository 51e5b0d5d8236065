//! Prometheus metrics of the control plane.

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntGaugeVec, Opts, TextEncoder};

/// Occupancy of the connection tracking table, per interface.
static CONNTRACK_ENTRIES: Lazy<Option<IntGaugeVec>> = Lazy::new(|| {
    let gauge = match IntGaugeVec::new(
        Opts::new(
            "netflow_conntrack_entries",
            "Entries in the connection tracking table after the last cleanup",
        ),
        &["interface"],
    ) {
        Ok(gauge) => gauge,
        Err(e) => {
            log::error!("Can't create conntrack gauge, {}", e);
            return None;
        }
    };

    // Already registered when the crate is linked twice, the gauge still works
    if let Err(e) = prometheus::register(Box::new(gauge.clone())) {
        log::warn!("Can't register conntrack gauge, {}", e);
    }

    Some(gauge)
});

pub fn set_conntrack_entries(ifname: &str, entries: usize) {
    if let Some(gauge) = CONNTRACK_ENTRIES.as_ref() {
        gauge.with_label_values(&[ifname]).set(entries as i64);
    }
}

pub fn conntrack_entries(ifname: &str) -> Option<i64> {
    CONNTRACK_ENTRIES
        .as_ref()
        .and_then(|gauge| gauge.get_metric_with_label_values(&[ifname]).ok())
        .map(|g| g.get())
}

/// Removes the series of a detached interface.
pub fn forget_interface(ifname: &str) {
    if let Some(gauge) = CONNTRACK_ENTRIES.as_ref() {
        let _ = gauge.remove_label_values(&[ifname]);
    }
}

/// Metrics of the default registry in text format.
pub fn gather() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        log::error!("Can't encode metrics, {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_per_interface() {
        set_conntrack_entries("stats-if0", 12);
        set_conntrack_entries("stats-if1", 3);
        assert_eq!(conntrack_entries("stats-if0"), Some(12));
        assert_eq!(conntrack_entries("stats-if1"), Some(3));
        assert!(gather().contains("netflow_conntrack_entries"));

        forget_interface("stats-if1");
        assert!(!gather().contains("stats-if1"));
    }
}
