//! In-process metric families with Prometheus text exposition.
//!
//! Series are created lazily the first time a label set is seen and are kept
//! in insertion order so the exposition output is stable between scrapes.
//! Every update takes the family's lock for the whole read-modify-write, so
//! concurrent requests never interleave on the same series.
use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Serialize;
use thiserror::Error;

/// Ordered label pairs. Keys are unique; insertion order is the canonical
/// serialization order.
pub type LabelSet = Vec<(String, String)>;

/// Errors raised while registering metric families.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("metric '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("histogram '{0}' needs at least one finite bucket bound")]
    InvalidBuckets(String),
}

/// Kind of a registered family, rendered in `# TYPE` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Histogram,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build an owned label set, keeping the first position of a key and the
/// last value given for it.
fn owned_labels(labels: &[(&str, &str)]) -> LabelSet {
    let mut out: LabelSet = Vec::with_capacity(labels.len());
    for (key, value) in labels {
        match out.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.to_string(),
            None => out.push((key.to_string(), value.to_string())),
        }
    }
    out
}

/// Insertion-ordered series storage shared by counters and histograms.
#[derive(Debug)]
struct SeriesTable<V> {
    index: HashMap<LabelSet, usize>,
    entries: Vec<(LabelSet, V)>,
}

impl<V> Default for SeriesTable<V> {
    fn default() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }
}

impl<V> SeriesTable<V> {
    fn get_or_insert_with(&mut self, labels: LabelSet, init: impl FnOnce() -> V) -> &mut V {
        let idx = match self.index.get(&labels) {
            Some(idx) => *idx,
            None => {
                let idx = self.entries.len();
                self.index.insert(labels.clone(), idx);
                self.entries.push((labels, init()));
                idx
            }
        };
        &mut self.entries[idx].1
    }

    fn get(&self, labels: &LabelSet) -> Option<&V> {
        self.index.get(labels).map(|idx| &self.entries[*idx].1)
    }
}

/// Monotonically non-decreasing counter family.
#[derive(Debug)]
pub struct Counter {
    name: String,
    help: String,
    series: Mutex<SeriesTable<f64>>,
}

impl Counter {
    fn new(name: &str, help: &str) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            series: Mutex::new(SeriesTable::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment the series identified by `labels` by one.
    pub fn inc(&self, labels: &[(&str, &str)]) {
        self.inc_by(labels, 1.0);
    }

    /// Increment by `amount`. Negative or NaN amounts are ignored so the
    /// series never decreases.
    pub fn inc_by(&self, labels: &[(&str, &str)], amount: f64) {
        if amount.is_nan() || amount < 0.0 {
            tracing::warn!(metric = %self.name, amount, "Ignoring negative or NaN counter increment");
            return;
        }
        let mut series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        *series.get_or_insert_with(owned_labels(labels), || 0.0) += amount;
    }

    /// Current value of a series, if it exists.
    pub fn get(&self, labels: &[(&str, &str)]) -> Option<f64> {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        series.get(&owned_labels(labels)).copied()
    }

    fn render(&self, out: &mut String) {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        for (labels, value) in &series.entries {
            let _ = writeln!(out, "{}{} {}", self.name, render_labels(labels, None), value);
        }
    }
}

#[derive(Debug, Clone)]
struct HistogramSeries {
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

/// Cumulative histogram family with fixed upper bounds plus an implicit
/// `+Inf` bucket.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    help: String,
    buckets: Vec<f64>,
    series: Mutex<SeriesTable<HistogramSeries>>,
}

/// Point-in-time copy of one histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// `(upper_bound, cumulative_count)` pairs, `+Inf` excluded.
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    pub count: u64,
}

impl Histogram {
    fn new(name: &str, help: &str, buckets: &[f64]) -> Result<Self, RegistryError> {
        let mut bounds: Vec<f64> = buckets.iter().copied().filter(|b| b.is_finite()).collect();
        if bounds.is_empty() {
            return Err(RegistryError::InvalidBuckets(name.to_string()));
        }
        bounds.sort_by(f64::total_cmp);
        bounds.dedup();

        Ok(Self {
            name: name.to_string(),
            help: help.to_string(),
            buckets: bounds,
            series: Mutex::new(SeriesTable::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record one observation for the series identified by `labels`.
    pub fn observe(&self, labels: &[(&str, &str)], value: f64) {
        if value.is_nan() {
            tracing::warn!(metric = %self.name, "Ignoring NaN histogram observation");
            return;
        }
        let bucket_len = self.buckets.len();
        let mut series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = series.get_or_insert_with(owned_labels(labels), || HistogramSeries {
            bucket_counts: vec![0; bucket_len],
            sum: 0.0,
            count: 0,
        });

        for (idx, bound) in self.buckets.iter().enumerate() {
            if value <= *bound {
                entry.bucket_counts[idx] = entry.bucket_counts[idx].saturating_add(1);
            }
        }
        entry.sum += value;
        entry.count = entry.count.saturating_add(1);
    }

    pub fn snapshot(&self, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        series.get(&owned_labels(labels)).map(|s| HistogramSnapshot {
            buckets: self
                .buckets
                .iter()
                .copied()
                .zip(s.bucket_counts.iter().copied())
                .collect(),
            sum: s.sum,
            count: s.count,
        })
    }

    fn render(&self, out: &mut String) {
        let series = self.series.lock().unwrap_or_else(PoisonError::into_inner);
        for (labels, hist) in &series.entries {
            for (bound, count) in self.buckets.iter().zip(&hist.bucket_counts) {
                let le = bound.to_string();
                let _ = writeln!(
                    out,
                    "{}_bucket{} {}",
                    self.name,
                    render_labels(labels, Some(&le)),
                    count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{} {}",
                self.name,
                render_labels(labels, Some("+Inf")),
                hist.count
            );
            let _ = writeln!(out, "{}_sum{} {}", self.name, render_labels(labels, None), hist.sum);
            let _ = writeln!(
                out,
                "{}_count{} {}",
                self.name,
                render_labels(labels, None),
                hist.count
            );
        }
    }
}

#[derive(Debug, Clone)]
enum Family {
    Counter(Arc<Counter>),
    Histogram(Arc<Histogram>),
}

impl Family {
    fn name(&self) -> &str {
        match self {
            Family::Counter(c) => c.name(),
            Family::Histogram(h) => h.name(),
        }
    }
}

/// Owner of all registered metric families.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    families: Mutex<Vec<Family>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(&self, name: &str, help: &str) -> Result<Arc<Counter>, RegistryError> {
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        if families.iter().any(|f| f.name() == name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        let counter = Arc::new(Counter::new(name, help));
        families.push(Family::Counter(counter.clone()));
        Ok(counter)
    }

    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        buckets: &[f64],
    ) -> Result<Arc<Histogram>, RegistryError> {
        let mut families = self.families.lock().unwrap_or_else(PoisonError::into_inner);
        if families.iter().any(|f| f.name() == name) {
            return Err(RegistryError::AlreadyRegistered(name.to_string()));
        }
        let histogram = Arc::new(Histogram::new(name, help, buckets)?);
        families.push(Family::Histogram(histogram.clone()));
        Ok(histogram)
    }

    /// Serialize every family in Prometheus text format.
    pub fn exposition(&self) -> String {
        let families = self.families.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let mut out = String::new();
        for family in &families {
            match family {
                Family::Counter(counter) => {
                    write_header(&mut out, &counter.name, &counter.help, MetricType::Counter);
                    counter.render(&mut out);
                }
                Family::Histogram(histogram) => {
                    write_header(&mut out, &histogram.name, &histogram.help, MetricType::Histogram);
                    histogram.render(&mut out);
                }
            }
        }
        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: MetricType) {
    let _ = writeln!(out, "# HELP {name} {}", escape_help(help));
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn render_labels(labels: &LabelSet, le: Option<&str>) -> String {
    if labels.is_empty() && le.is_none() {
        return String::new();
    }
    let mut parts: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        parts.push(format!("le=\"{le}\""));
    }
    format!("{{{}}}", parts.join(","))
}

/// Escape a label value so `\`, `"` and newlines survive the text format.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
