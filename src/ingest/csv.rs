//! CSV format
//!
//! Records are `selector,timestamp,value`, where the selector holds only
//! `label="value"` pairs and must be quoted for CSV when it contains
//! commas, e.g. `"cpu{host=""a"",dc=""eu""}",1700000000000,0.5`.
//! Timestamps are Unix milliseconds or RFC 3339.

use crate::ingest::{ImportError, ImportResult};
use crate::query::parse_series;
use crate::storage::metric_name::MetricName;
use crate::storage::types::{MetricRow, Series};
use std::io::{Read, Write};

fn parse_timestamp(s: &str) -> Option<i64> {
    s.parse::<i64>().ok().or_else(|| {
        chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis())
    })
}

/// Decode one record
pub fn parse_record(record: &csv::StringRecord, line_no: u64) -> ImportResult<MetricRow> {
    let err = |message: String| ImportError::Parse {
        line: line_no,
        message,
    };
    if record.len() != 3 {
        return Err(err(format!("expected 3 fields, got {}", record.len())));
    }
    let labels = parse_series(record[0].trim()).map_err(|e| err(e.to_string()))?;
    let ts = record[1].trim();
    let timestamp = parse_timestamp(ts).ok_or_else(|| err(format!("invalid timestamp {:?}", ts)))?;
    let v = record[2].trim();
    let value = v
        .parse::<f64>()
        .map_err(|_| err(format!("invalid value {:?}", v)))?;
    Ok(MetricRow::new(MetricName::marshal_raw(&labels), timestamp, value))
}

/// Reader over CSV input without a header row
pub fn reader<R: Read>(r: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(r)
}

/// Write every sample of `series` as one record
pub fn write_series<W: Write>(w: &mut csv::Writer<W>, series: &Series) -> ImportResult<()> {
    let selector = series.metric_name.to_string();
    for (ts, v) in series.timestamps.iter().zip(&series.values) {
        let (ts, v) = (ts.to_string(), v.to_string());
        w.write_record([selector.as_str(), ts.as_str(), v.as_str()])?;
    }
    Ok(())
}
