//! Process-wide metrics facade plus progress events for atlas runs.
//!
//! Metric calls compile to no-ops unless the `telemetry` feature is enabled.
//! Counters and gauges are atomics once registered, so worker threads only
//! take the registry lock the first time a name is seen.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod events;
pub mod tags;
pub mod worker;

pub use events::{MapProgress, NoopProgressSink, ProgressEvent, ProgressSink};
pub use worker::{DefaultWorkerTelemetry, WorkerTelemetry};

/// Summary statistics of one histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    /// Total number of samples recorded.
    pub count: u64,
    /// Sum of every recorded sample.
    pub total: u64,
    /// Smallest sample seen, 0 when nothing was recorded.
    pub min: u64,
    /// Largest sample seen.
    pub max: u64,
    /// Arithmetic mean of the samples.
    pub mean: f64,
}

/// Point-in-time copy of every counter, gauge and histogram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Map of counter names to their current values.
    pub counters: BTreeMap<String, u64>,
    /// Map of gauge names to their last value.
    pub gauges: BTreeMap<String, u64>,
    /// Map of histogram names to their summaries.
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl TelemetrySnapshot {
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    pub fn counter_or_zero(&self, name: &str) -> u64 {
        self.counter(name).unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<u64> {
        self.gauges.get(name).copied()
    }

    pub fn histogram(&self, name: &str) -> Option<HistogramSnapshot> {
        self.histograms.get(name).copied()
    }

    /// Activity recorded between `earlier` and `self`.
    ///
    /// Counters and histogram counts become deltas; gauges keep their current
    /// value. Histogram min and max cannot be windowed and are kept as is.
    pub fn since(&self, earlier: &TelemetrySnapshot) -> TelemetrySnapshot {
        let counters = self
            .counters
            .iter()
            .filter_map(|(name, value)| {
                let delta = value.saturating_sub(earlier.counter_or_zero(name));
                (delta > 0).then(|| (name.clone(), delta))
            })
            .collect();

        let histograms = self
            .histograms
            .iter()
            .filter_map(|(name, current)| {
                let before = earlier.histogram(name).unwrap_or_default();
                let count = current.count.saturating_sub(before.count);
                if count == 0 {
                    return None;
                }
                let total = current.total.saturating_sub(before.total);
                Some((
                    name.clone(),
                    HistogramSnapshot {
                        count,
                        total,
                        min: current.min,
                        max: current.max,
                        mean: total as f64 / count as f64,
                    },
                ))
            })
            .collect();

        TelemetrySnapshot {
            counters,
            gauges: self.gauges.clone(),
            histograms,
        }
    }
}

/// Labels are accepted for call-site readability; the registry keys on name only.
#[inline]
pub fn increment_counter(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::counter(name).fetch_add(value, std::sync::atomic::Ordering::Relaxed);

    let _ = (name, value);
}

#[inline]
pub fn record_histogram(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::record_histogram(name, value);

    let _ = (name, value);
}

#[inline]
pub fn set_gauge(name: &'static str, value: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::gauge(name).store(value, std::sync::atomic::Ordering::Relaxed);

    let _ = (name, value);
}

#[inline]
pub fn add_gauge(name: &'static str, delta: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    registry::gauge(name).fetch_add(delta, std::sync::atomic::Ordering::Relaxed);

    let _ = (name, delta);
}

/// Subtracts `delta` from a gauge, stopping at zero.
#[inline]
pub fn sub_gauge_saturating(name: &'static str, delta: u64, _labels: &[(&str, &str)]) {
    #[cfg(feature = "telemetry")]
    {
        use std::sync::atomic::Ordering;
        let _ = registry::gauge(name).fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
            Some(current.saturating_sub(delta))
        });
    }

    let _ = (name, delta);
}

pub fn snapshot() -> TelemetrySnapshot {
    #[cfg(feature = "telemetry")]
    {
        registry::snapshot()
    }

    #[cfg(not(feature = "telemetry"))]
    {
        TelemetrySnapshot::default()
    }
}

/// Forgets every metric recorded so far.
pub fn reset() {
    #[cfg(feature = "telemetry")]
    registry::reset();
}

#[cfg(feature = "telemetry")]
mod registry {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};

    use super::{HistogramSnapshot, TelemetrySnapshot};

    type Cells = RwLock<HashMap<&'static str, Arc<AtomicU64>>>;

    #[derive(Debug, Clone, Copy, Default)]
    struct Histogram {
        count: u64,
        total: u64,
        min: u64,
        max: u64,
    }

    impl Histogram {
        fn record(&mut self, value: u64) {
            self.min = if self.count == 0 { value } else { self.min.min(value) };
            self.max = self.max.max(value);
            self.count = self.count.saturating_add(1);
            self.total = self.total.saturating_add(value);
        }

        fn summary(&self) -> HistogramSnapshot {
            let mean = match self.count {
                0 => 0.0,
                count => self.total as f64 / count as f64,
            };
            HistogramSnapshot {
                count: self.count,
                total: self.total,
                min: self.min,
                max: self.max,
                mean,
            }
        }
    }

    #[derive(Default)]
    struct Registry {
        counters: Cells,
        gauges: Cells,
        histograms: Mutex<BTreeMap<&'static str, Histogram>>,
    }

    fn registry() -> &'static Registry {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();
        REGISTRY.get_or_init(Registry::default)
    }

    fn cell(cells: &Cells, name: &'static str) -> Arc<AtomicU64> {
        if let Some(cell) = cells
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
        {
            return Arc::clone(cell);
        }
        let mut cells = cells
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(cells.entry(name).or_default())
    }

    fn read_cells(cells: &Cells) -> BTreeMap<String, u64> {
        cells
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(name, value)| ((*name).to_owned(), value.load(Ordering::Relaxed)))
            .collect()
    }

    fn histograms() -> MutexGuard<'static, BTreeMap<&'static str, Histogram>> {
        registry()
            .histograms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) fn counter(name: &'static str) -> Arc<AtomicU64> {
        cell(&registry().counters, name)
    }

    pub(super) fn gauge(name: &'static str) -> Arc<AtomicU64> {
        cell(&registry().gauges, name)
    }

    pub(super) fn record_histogram(name: &'static str, value: u64) {
        histograms().entry(name).or_default().record(value);
    }

    pub(super) fn snapshot() -> TelemetrySnapshot {
        let registry = registry();
        TelemetrySnapshot {
            counters: read_cells(&registry.counters),
            gauges: read_cells(&registry.gauges),
            histograms: histograms()
                .iter()
                .map(|(name, histogram)| ((*name).to_owned(), histogram.summary()))
                .collect(),
        }
    }

    pub(super) fn reset() {
        let registry = registry();
        for cells in [&registry.counters, &registry.gauges] {
            cells
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
        }
        histograms().clear();
    }
}
