use std::fmt::Write as _;

use crate::models::query::QueryResponse;

/// Renders a `QueryResponse` in the caller's requested wire format. JSON is
/// the native shape; CSV and line-protocol flatten each point's labels into
/// a single field for tooling that doesn't want a nested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
    LineProtocol,
}

pub struct ExportFormatter;

impl ExportFormatter {
    pub fn render(response: &QueryResponse, format: ExportFormat) -> Result<String, String> {
        match format {
            ExportFormat::Json => Self::to_json(response),
            ExportFormat::Csv => Ok(Self::to_csv(response)),
            ExportFormat::LineProtocol => Ok(Self::to_line_protocol(response)),
        }
    }

    fn to_json(response: &QueryResponse) -> Result<String, String> {
        serde_json::to_string_pretty(response).map_err(|e| format!("failed to render JSON: {e}"))
    }

    /// Header `timestamp,metric,value,labels`, one row per point. The labels
    /// column holds the point's label set as a comma-free `k=v;k=v` string so
    /// the row stays on one CSV field.
    fn to_csv(response: &QueryResponse) -> String {
        let mut out = String::from("timestamp,metric,value,labels\n");
        for point in &response.points {
            let _ = writeln!(
                out,
                "{},{},{},{}",
                point.timestamp.to_rfc3339(),
                csv_quote(&response.metric_name),
                point.value,
                csv_quote(&label_string(&point.labels))
            );
        }
        out
    }

    /// `<metric>{k="v",...} <value> <epochMillis>`; empty label set omits the
    /// brace group entirely.
    fn to_line_protocol(response: &QueryResponse) -> String {
        let mut out = String::new();
        for point in &response.points {
            if point.labels.is_empty() {
                let _ = writeln!(out, "{} {} {}", response.metric_name, point.value, point.timestamp.timestamp_millis());
            } else {
                let tags: Vec<String> = point.labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
                let _ = writeln!(
                    out,
                    "{}{{{}}} {} {}",
                    response.metric_name,
                    tags.join(","),
                    point.value,
                    point.timestamp.timestamp_millis()
                );
            }
        }
        out
    }
}

fn label_string(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(";")
}

fn csv_quote(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::query::{Aggregation, DataPoint};
    use chrono::{DateTime, Utc};

    fn response() -> QueryResponse {
        let t = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        QueryResponse {
            metric_name: "cpu.load".to_string(),
            aggregation: Aggregation::Raw,
            points: vec![
                DataPoint { timestamp: t, value: 1.5, labels: Default::default() },
                DataPoint { timestamp: t + chrono::Duration::seconds(10), value: 2.5, labels: Default::default() },
            ],
            truncated: false,
            served_from_archive: false,
        }
    }

    #[test]
    fn json_round_trips_points() {
        let rendered = ExportFormatter::render(&response(), ExportFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["points"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["metric_name"], "cpu.load");
    }

    #[test]
    fn csv_has_header_and_one_row_per_point() {
        let rendered = ExportFormatter::render(&response(), ExportFormat::Csv).unwrap();
        let mut lines = rendered.lines();
        assert_eq!(lines.next().unwrap(), "timestamp,metric,value,labels");
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn csv_quotes_metric_names_containing_commas() {
        let mut resp = response();
        resp.metric_name = "cpu,load".to_string();
        let rendered = ExportFormatter::render(&resp, ExportFormat::Csv).unwrap();
        assert!(rendered.contains("\"cpu,load\""));
    }

    #[test]
    fn line_protocol_has_one_line_per_point() {
        let rendered = ExportFormatter::render(&response(), ExportFormat::LineProtocol).unwrap();
        assert_eq!(rendered.lines().count(), 2);
        let first = rendered.lines().next().unwrap();
        assert!(first.starts_with("cpu.load 1.5 "));
    }

    #[test]
    fn line_protocol_renders_tag_set_when_point_has_labels() {
        let mut resp = response();
        resp.points[0].labels.insert("host".to_string(), "a".to_string());
        let rendered = ExportFormatter::render(&resp, ExportFormat::LineProtocol).unwrap();
        let first = rendered.lines().next().unwrap();
        assert!(first.starts_with("cpu.load{host=\"a\"} 1.5 "));
    }

    #[test]
    fn csv_labels_column_reflects_point_labels() {
        let mut resp = response();
        resp.points[0].labels.insert("host".to_string(), "a".to_string());
        let rendered = ExportFormatter::render(&resp, ExportFormat::Csv).unwrap();
        let row = rendered.lines().nth(1).unwrap();
        assert!(row.ends_with("host=a"));
    }
}
