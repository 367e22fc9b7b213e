//! Usage counters for toggles and variants.
//!
//! Counters are kept in memory only. Reporting them anywhere is up to the application: read
//! [`MetricsBucket::take`] periodically, or plug a custom [`MetricsSink`] into
//! [`ClientConfig::metrics_sink`](crate::ClientConfig::metrics_sink).
use std::{collections::HashMap, sync::Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Receives usage counts from the client.
///
/// Called on the evaluation path: implementations must be cheap and must not block. Panics are
/// caught and logged.
///
/// Only toggles present in the active collection are reported, so the set of names is bounded by
/// the collection.
pub trait MetricsSink {
    /// Record one evaluation of `toggle_name`.
    fn record_evaluation(&self, toggle_name: &str, enabled: bool);
    /// Record one variant assignment for `toggle_name`.
    fn record_variant(&self, toggle_name: &str, variant_name: &str);
}

/// Usage counts of a single toggle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToggleCounts {
    /// Evaluations that returned enabled.
    pub yes: u64,
    /// Evaluations that returned disabled.
    pub no: u64,
    /// Assignments per variant name.
    pub variants: HashMap<String, u64>,
}

/// Counters accumulated since `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Start of the counting window.
    pub start: DateTime<Utc>,
    /// Per-toggle counts.
    pub toggles: HashMap<String, ToggleCounts>,
}

/// Default in-memory [`MetricsSink`].
#[derive(Debug)]
pub struct MetricsBucket {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsBucket {
    /// Create an empty bucket starting now.
    pub fn new() -> MetricsBucket {
        MetricsBucket {
            inner: Mutex::new(MetricsSnapshot {
                start: Utc::now(),
                toggles: HashMap::new(),
            }),
        }
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.lock().clone()
    }

    /// Return the current counters and reset the bucket.
    pub fn take(&self) -> MetricsSnapshot {
        let mut inner = self.lock();
        std::mem::replace(
            &mut *inner,
            MetricsSnapshot {
                start: Utc::now(),
                toggles: HashMap::new(),
            },
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsSnapshot> {
        // Counters are plain integers and stay valid even if a holder panicked.
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MetricsBucket {
    fn default() -> MetricsBucket {
        MetricsBucket::new()
    }
}

impl MetricsSink for MetricsBucket {
    fn record_evaluation(&self, toggle_name: &str, enabled: bool) {
        let mut inner = self.lock();
        let counts = inner.toggles.entry(toggle_name.to_owned()).or_default();
        if enabled {
            counts.yes += 1;
        } else {
            counts.no += 1;
        }
    }

    fn record_variant(&self, toggle_name: &str, variant_name: &str) {
        let mut inner = self.lock();
        *inner
            .toggles
            .entry(toggle_name.to_owned())
            .or_default()
            .variants
            .entry(variant_name.to_owned())
            .or_default() += 1;
    }
}
