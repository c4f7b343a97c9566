//! Parser and aggregator for Prometheus text exposition.
//!
//! Turns exposition text (ours or any other well-formed producer's) back into
//! a structured model grouped by metric family and by `route` label. Label
//! blocks are read with a character scanner that understands quoting and
//! backslash escapes, so values may carry commas, braces or whole JSON
//! documents. Problems are isolated: a bad label or line is logged and
//! skipped, never aborting the rest of the payload.
use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Label whose value is additionally decoded as JSON.
pub const REQUEST_DETAILS_LABEL: &str = "request_details";
const ROUTE_LABEL: &str = "route";
const STATUS_CODE_LABEL: &str = "status_code";
const METHOD_LABEL: &str = "method";

/// Problems found while parsing one line or one label.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsParseError {
    #[error("line {line}: missing sample value")]
    MissingValue { line: usize },

    #[error("line {line}: invalid sample value '{value}'")]
    InvalidValue { line: usize, value: String },

    #[error("line {line}: label block is not terminated")]
    UnterminatedLabels { line: usize },

    #[error("line {line}: label '{label}' has no value")]
    LabelWithoutValue { line: usize, label: String },

    #[error("line {line}: request_details is not valid JSON: {source}")]
    InvalidDetails {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// One parsed label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub key: String,
    pub value: String,
    pub is_method: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One parsed data line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub name: String,
    pub labels: Vec<Label>,
    pub value: f64,
    pub status_class: String,
    pub formatted_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Sample {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }
}

/// A metric family and every sample recorded under its `# HELP` context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricFamily {
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub samples: Vec<Sample>,
}

/// A family restricted to the samples of one route.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetricFamily {
    #[serde(flatten)]
    pub family: MetricFamily,
    pub route_samples: Vec<Sample>,
    pub has_route_samples: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteMetrics {
    pub route: String,
    pub metrics: Vec<RouteMetricFamily>,
}

/// Structured view over an exposition payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsDocument {
    pub metrics: Vec<MetricFamily>,
    pub routes: Vec<RouteMetrics>,
}

impl MetricsDocument {
    pub fn family(&self, name: &str) -> Option<&MetricFamily> {
        self.metrics.iter().find(|m| m.name == name)
    }

    pub fn route(&self, route: &str) -> Option<&RouteMetrics> {
        self.routes.iter().find(|r| r.route == route)
    }
}

/// Parse exposition text into a [`MetricsDocument`].
///
/// Never fails as a whole; per-line problems are logged at `warn` and the
/// offending line (or label) is dropped.
pub fn parse_exposition(text: &str) -> MetricsDocument {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut current: Option<usize> = None;

    for (line_idx, raw_line) in text.lines().enumerate() {
        let line_no = line_idx + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim_start();
            if let Some(rest) = comment.strip_prefix("HELP ") {
                let (name, help) = split_first_word(rest);
                if name.is_empty() {
                    continue;
                }
                let idx = *index.entry(name.to_string()).or_insert_with(|| {
                    families.push(MetricFamily {
                        name: name.to_string(),
                        help: String::new(),
                        metric_type: String::new(),
                        samples: Vec::new(),
                    });
                    families.len() - 1
                });
                families[idx].help = unescape_help(help);
                current = Some(idx);
            } else if let Some(rest) = comment.strip_prefix("TYPE ") {
                let (name, kind) = split_first_word(rest);
                if let Some(idx) = index.get(name) {
                    families[*idx].metric_type = kind.trim().to_string();
                }
            }
            continue;
        }

        let Some(idx) = current else {
            tracing::debug!(line = line_no, "Skipping sample outside of a HELP context");
            continue;
        };

        match parse_sample_line(line, line_no) {
            Ok(sample) => families[idx].samples.push(sample),
            Err(error) => tracing::warn!(%error, "Skipping malformed exposition line"),
        }
    }

    let routes = group_by_route(&families);
    MetricsDocument {
        metrics: families,
        routes,
    }
}

fn split_first_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(pos) => (&input[..pos], input[pos..].trim_start()),
        None => (input, ""),
    }
}

/// Parse `<name>{<labels>} <value> [timestamp]` or `<name> <value>`.
fn parse_sample_line(line: &str, line_no: usize) -> Result<Sample, MetricsParseError> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    let mut rest = &line[name_end..];

    let mut labels = Vec::new();
    if let Some(block) = rest.strip_prefix('{') {
        let scanned = LabelScanner::new(line_no).scan(block)?;
        for issue in &scanned.issues {
            tracing::warn!(error = %issue, metric = name, "Dropping malformed label");
        }
        labels = scanned.labels;
        rest = &block[scanned.consumed..];
    }

    let value_token = rest
        .split_whitespace()
        .next()
        .ok_or(MetricsParseError::MissingValue { line: line_no })?;
    let value = parse_value(value_token).ok_or_else(|| MetricsParseError::InvalidValue {
        line: line_no,
        value: value_token.to_string(),
    })?;

    let status_class = labels
        .iter()
        .find(|l| l.key == STATUS_CODE_LABEL)
        .map(|l| status_class(&l.value))
        .unwrap_or_default();
    let details = labels.iter().find_map(|l| l.details.clone());

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        status_class,
        formatted_value: format!("{value:.4}"),
        details,
    })
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => token.parse().ok(),
    }
}

/// `status-Nxx` from the first digit of a status code, empty otherwise.
pub fn status_class(status_code: &str) -> String {
    match status_code.chars().next() {
        Some(d @ '2'..='5') => format!("status-{d}xx"),
        _ => String::new(),
    }
}

struct ScannedLabels {
    labels: Vec<Label>,
    issues: Vec<MetricsParseError>,
    /// Bytes consumed including the closing brace.
    consumed: usize,
}

/// Character scanner for the body of a `{...}` label block.
struct LabelScanner {
    line: usize,
    reading_key: bool,
    in_quotes: bool,
    escaped: bool,
    key: String,
    raw_value: String,
    labels: Vec<Label>,
    issues: Vec<MetricsParseError>,
}

impl LabelScanner {
    fn new(line: usize) -> Self {
        Self {
            line,
            reading_key: true,
            in_quotes: false,
            escaped: false,
            key: String::new(),
            raw_value: String::new(),
            labels: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn scan(mut self, block: &str) -> Result<ScannedLabels, MetricsParseError> {
        for (pos, c) in block.char_indices() {
            if self.escaped {
                self.raw_value.push(c);
                self.escaped = false;
                continue;
            }

            match c {
                '\\' if !self.reading_key && self.in_quotes => {
                    self.raw_value.push(c);
                    self.escaped = true;
                }
                '"' if !self.reading_key => {
                    self.in_quotes = !self.in_quotes;
                    self.raw_value.push(c);
                }
                '=' if self.reading_key => self.reading_key = false,
                ',' if !self.in_quotes => self.finish_label(),
                '}' if !self.in_quotes => {
                    self.finish_label();
                    return Ok(ScannedLabels {
                        labels: self.labels,
                        issues: self.issues,
                        consumed: pos + c.len_utf8(),
                    });
                }
                _ if self.reading_key => self.key.push(c),
                _ => self.raw_value.push(c),
            }
        }

        Err(MetricsParseError::UnterminatedLabels { line: self.line })
    }

    fn finish_label(&mut self) {
        let key = std::mem::take(&mut self.key).trim().to_string();
        let raw = std::mem::take(&mut self.raw_value);
        let had_separator = !self.reading_key;
        self.reading_key = true;
        self.in_quotes = false;
        self.escaped = false;

        if key.is_empty() {
            return;
        }
        if !had_separator {
            self.issues.push(MetricsParseError::LabelWithoutValue {
                line: self.line,
                label: key,
            });
            return;
        }

        let value = unescape_label_value(strip_quotes(raw.trim()));
        let details = if key == REQUEST_DETAILS_LABEL {
            match serde_json::from_str::<Value>(&value) {
                Ok(details) => Some(details),
                Err(source) => {
                    self.issues.push(MetricsParseError::InvalidDetails {
                        line: self.line,
                        source,
                    });
                    None
                }
            }
        } else {
            None
        };

        self.labels.push(Label {
            is_method: key == METHOD_LABEL,
            key,
            value,
            details,
        });
    }
}

fn strip_quotes(value: &str) -> &str {
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Reverse of [`super::registry::escape_label_value`].
pub fn unescape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn unescape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn group_by_route(families: &[MetricFamily]) -> Vec<RouteMetrics> {
    let mut routes: Vec<String> = Vec::new();
    for sample in families.iter().flat_map(|f| &f.samples) {
        if let Some(route) = sample.label(ROUTE_LABEL)
            && !routes.iter().any(|r| r == route)
        {
            routes.push(route.to_string());
        }
    }

    routes
        .into_iter()
        .map(|route| {
            let metrics = families
                .iter()
                .map(|family| {
                    let route_samples: Vec<Sample> = family
                        .samples
                        .iter()
                        .filter(|s| s.label(ROUTE_LABEL) == Some(route.as_str()))
                        .cloned()
                        .collect();
                    RouteMetricFamily {
                        family: family.clone(),
                        has_route_samples: !route_samples.is_empty(),
                        route_samples,
                    }
                })
                .collect();
            RouteMetrics { route, metrics }
        })
        .collect()
}
