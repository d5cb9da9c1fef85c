//! JSON lines format
//!
//! One series per line, the same shape `export` produces:
//!
//! ```text
//! {"metric":{"__name__":"cpu","host":"a"},"values":[0.5,0.7],"timestamps":[1700000000000,1700000010000]}
//! ```

use crate::ingest::{ImportError, ImportResult};
use crate::storage::metric_name::MetricName;
use crate::storage::types::{MetricRow, Series};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;

/// One line of the format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLine {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<f64>,
    pub timestamps: Vec<i64>,
}

impl JsonLine {
    pub fn from_series(series: &Series) -> Self {
        Self {
            metric: series.metric_name.labels().into_iter().collect(),
            values: series.values.clone(),
            timestamps: series.timestamps.clone(),
        }
    }

    /// Rows for every sample of the line
    pub fn into_rows(self) -> Vec<MetricRow> {
        let labels: Vec<(&String, &String)> = self.metric.iter().collect();
        let raw = MetricName::marshal_raw(&labels);
        self.timestamps
            .into_iter()
            .zip(self.values)
            .map(|(ts, v)| MetricRow::new(raw.clone(), ts, v))
            .collect()
    }
}

/// Decode one line; blank lines yield no rows
pub fn parse_line(line: &str, line_no: u64) -> ImportResult<Vec<MetricRow>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }
    let parsed: JsonLine = serde_json::from_str(line).map_err(|e| ImportError::Parse {
        line: line_no,
        message: e.to_string(),
    })?;
    if parsed.metric.is_empty() {
        return Err(ImportError::Parse {
            line: line_no,
            message: "\"metric\" must contain at least one label".into(),
        });
    }
    if parsed.values.len() != parsed.timestamps.len() {
        return Err(ImportError::Parse {
            line: line_no,
            message: format!(
                "{} values but {} timestamps",
                parsed.values.len(),
                parsed.timestamps.len()
            ),
        });
    }
    Ok(parsed.into_rows())
}

/// Write one series as a line
pub fn write_series<W: Write>(w: &mut W, series: &Series) -> ImportResult<()> {
    serde_json::to_writer(&mut *w, &JsonLine::from_series(series))
        .map_err(|e| ImportError::Io(e.into()))?;
    w.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tsid::Tsid;

    #[test]
    fn test_parse_line() {
        let rows = parse_line(
            r#"{"metric":{"__name__":"cpu","host":"a"},"values":[1.5,2],"timestamps":[1000,2000]}"#,
            1,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].timestamp, 2000);
        assert_eq!(rows[1].value, 2.0);
        let mn = MetricName::from_raw(&rows[0].metric_name_raw).unwrap();
        assert_eq!(mn.metric_group, "cpu");
        assert_eq!(mn.label_value("host"), Some("a"));
        assert!(parse_line("   ", 2).unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors_carry_line() {
        let err = parse_line(r#"{"metric":{"a":"b"},"values":[1],"timestamps":[]}"#, 7).unwrap_err();
        assert!(matches!(err, ImportError::Parse { line: 7, .. }));
        assert!(parse_line(r#"{"metric":{},"values":[],"timestamps":[]}"#, 1).is_err());
        assert!(parse_line("not json", 1).is_err());
    }

    #[test]
    fn test_written_series_parses_back() {
        let series = Series {
            tsid: Tsid::default(),
            metric_name: MetricName::new("up", vec![]).tag("job", "api"),
            timestamps: vec![10, 20],
            values: vec![1.0, 0.0],
        };
        let mut out = Vec::new();
        write_series(&mut out, &series).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        let line: JsonLine = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(line.metric.get("__name__").map(String::as_str), Some("up"));
        assert_eq!(line.timestamps, vec![10, 20]);
    }
}
