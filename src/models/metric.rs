use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// `^[a-zA-Z][a-zA-Z0-9_.-]*$`
pub const METRIC_NAME_MAX_LEN: usize = 255;
pub const METRIC_DESCRIPTION_MAX_LEN: usize = 1000;
pub const METRIC_UNIT_MAX_LEN: usize = 100;
pub const RETENTION_DAYS_MIN: u32 = 1;
pub const RETENTION_DAYS_MAX: u32 = 1825;
pub const RETENTION_DAYS_DEFAULT: u32 = 30;

/// `^[a-zA-Z][a-zA-Z0-9_]*$`
pub const LABEL_KEY_MAX_LEN: usize = 100;
pub const LABEL_VALUE_MAX_LEN: usize = 100;
pub const MAX_LABELS_PER_METRIC: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "COUNTER",
            MetricKind::Gauge => "GAUGE",
            MetricKind::Histogram => "HISTOGRAM",
            MetricKind::Summary => "SUMMARY",
        }
    }
}

impl std::str::FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COUNTER" => Ok(MetricKind::Counter),
            "GAUGE" => Ok(MetricKind::Gauge),
            "HISTOGRAM" => Ok(MetricKind::Histogram),
            "SUMMARY" => Ok(MetricKind::Summary),
            other => Err(format!("unknown metric kind '{other}'")),
        }
    }
}

/// A metric definition, owned by the MetricRegistry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub name: String,
    pub kind: MetricKind,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub retention_days: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Recognized label keys for this metric (the LabelSchema, by value).
    pub labels: BTreeSet<String>,
}

/// Request payload to register a new metric.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub kind: MetricKind,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

fn default_retention_days() -> u32 {
    RETENTION_DAYS_DEFAULT
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricUpdate {
    pub retention_days: Option<u32>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricFilter {
    pub active_only: bool,
    pub kind: Option<MetricKind>,
    pub name_prefix: Option<String>,
}

static NAME_RE: once_lock_regex::OnceRegex = once_lock_regex::OnceRegex::new(r"^[a-zA-Z][a-zA-Z0-9_.\-]*$");
static LABEL_KEY_RE: once_lock_regex::OnceRegex = once_lock_regex::OnceRegex::new(r"^[a-zA-Z][a-zA-Z0-9_]*$");

/// Validate a metric name: regex, length, non-empty.
pub fn validate_metric_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name.len() > METRIC_NAME_MAX_LEN {
        return Err(format!(
            "name exceeds {METRIC_NAME_MAX_LEN} characters"
        ));
    }
    if !NAME_RE.get().is_match(name) {
        return Err(format!(
            "name '{name}' must match ^[a-zA-Z][a-zA-Z0-9_.-]*$"
        ));
    }
    Ok(())
}

/// Validate a single label key against the LabelSchema regex/length rules.
pub fn validate_label_key(key: &str) -> Result<(), String> {
    if key.len() > LABEL_KEY_MAX_LEN {
        return Err(format!("label key '{key}' exceeds {LABEL_KEY_MAX_LEN} characters"));
    }
    if !LABEL_KEY_RE.get().is_match(key) {
        return Err(format!(
            "label key '{key}' must match ^[a-zA-Z][a-zA-Z0-9_]*$"
        ));
    }
    Ok(())
}

/// Validate a label value: non-empty, bounded length.
pub fn validate_label_value(key: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("label '{key}' value must not be empty"));
    }
    if value.len() > LABEL_VALUE_MAX_LEN {
        return Err(format!(
            "label '{key}' value exceeds {LABEL_VALUE_MAX_LEN} characters"
        ));
    }
    Ok(())
}

pub fn validate_label_schema(labels: &BTreeSet<String>) -> Result<(), String> {
    if labels.len() > MAX_LABELS_PER_METRIC {
        return Err(format!(
            "label schema has {} keys, exceeds max {MAX_LABELS_PER_METRIC}",
            labels.len()
        ));
    }
    for key in labels {
        validate_label_key(key)?;
    }
    Ok(())
}

pub fn validate_retention_days(days: u32) -> Result<(), String> {
    if !(RETENTION_DAYS_MIN..=RETENTION_DAYS_MAX).contains(&days) {
        return Err(format!(
            "retention_days {days} must be between {RETENTION_DAYS_MIN} and {RETENTION_DAYS_MAX}"
        ));
    }
    Ok(())
}

/// Tiny `OnceLock<Regex>` wrapper so the patterns above read like plain consts.
pub mod once_lock_regex {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex {
        pattern: &'static str,
        cell: OnceLock<Regex>,
    }

    impl OnceRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self {
                pattern,
                cell: OnceLock::new(),
            }
        }

        pub fn get(&self) -> &Regex {
            self.cell.get_or_init(|| Regex::new(self.pattern).expect("static regex is valid"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_regex_accepts_valid_names() {
        assert!(validate_metric_name("cpu").is_ok());
        assert!(validate_metric_name("http.requests_total").is_ok());
        assert!(validate_metric_name("a-b-c").is_ok());
    }

    #[test]
    fn name_regex_rejects_leading_digit() {
        assert!(validate_metric_name("1cpu").is_err());
    }

    #[test]
    fn name_length_boundary() {
        let ok = "a".repeat(METRIC_NAME_MAX_LEN);
        assert!(validate_metric_name(&ok).is_ok());
        let too_long = "a".repeat(METRIC_NAME_MAX_LEN + 1);
        assert!(validate_metric_name(&too_long).is_err());
    }

    #[test]
    fn label_schema_boundary_ten_accepted_eleven_rejected() {
        let ten: BTreeSet<String> = (0..10).map(|i| format!("k{i}")).collect();
        assert!(validate_label_schema(&ten).is_ok());
        let eleven: BTreeSet<String> = (0..11).map(|i| format!("k{i}")).collect();
        assert!(validate_label_schema(&eleven).is_err());
    }

    #[test]
    fn label_value_length_boundary() {
        let ok = "v".repeat(LABEL_VALUE_MAX_LEN);
        assert!(validate_label_value("k", &ok).is_ok());
        let too_long = "v".repeat(LABEL_VALUE_MAX_LEN + 1);
        assert!(validate_label_value("k", &too_long).is_err());
    }

    #[test]
    fn retention_days_boundaries() {
        assert!(validate_retention_days(1).is_ok());
        assert!(validate_retention_days(1825).is_ok());
        assert!(validate_retention_days(0).is_err());
        assert!(validate_retention_days(1826).is_err());
    }
}
