//! Bounded fan-out of decoded rows into the storage engine
//!
//! The reader thread decodes the input and cuts it into batches; batches
//! go through the [`WorkerPool`] queue to a fixed set of insert workers.
//! A full queue blocks the reader, so a fast producer cannot buffer an
//! unbounded amount of rows in memory.

use crate::concurrency::WorkerPool;
use crate::encoding::check_precision_bits;
use crate::ingest::{csv, jsonl, ImportError, ImportFormat, ImportResult};
use crate::storage::{IngestStats, MetricRow, StorageEngine, StorageError};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;

/// Configuration for the importer
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Insert workers; 0 means one per CPU
    pub workers: usize,
    /// Batches waiting for a worker before the reader blocks
    pub queue_size: usize,
    /// Rows per `add_rows` call
    pub batch_size: usize,
    pub precision_bits: u8,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_size: 0,
            batch_size: 10_000,
            precision_bits: 64,
        }
    }
}

/// Outcome of one import
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportStats {
    pub lines: u64,
    pub rows_parsed: u64,
    pub parse_errors: u64,
    /// First parse error, for the caller to show
    pub first_parse_error: Option<String>,
    pub batches: u64,
    pub ingest: IngestStats,
    pub elapsed_ms: u64,
}

impl std::fmt::Display for ImportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} lines, {} rows parsed, {} added, {} dropped, {} parse errors in {} ms",
            self.lines,
            self.rows_parsed,
            self.ingest.rows_added,
            self.ingest.rows_dropped(),
            self.parse_errors,
            self.elapsed_ms
        )
    }
}

#[derive(Default)]
struct Outcome {
    ingest: IngestStats,
    error: Option<StorageError>,
}

/// Imports text streams into one engine
pub struct Importer {
    engine: Arc<StorageEngine>,
    pool: WorkerPool,
    config: ImporterConfig,
}

impl Importer {
    pub fn new(engine: Arc<StorageEngine>, mut config: ImporterConfig) -> ImportResult<Self> {
        check_precision_bits(config.precision_bits)?;
        if config.workers == 0 {
            config.workers = num_cpus::get();
        }
        if config.queue_size == 0 {
            config.queue_size = config.workers * 2;
        }
        config.batch_size = config.batch_size.max(1);
        let pool = WorkerPool::new("strata-insert", config.workers, config.queue_size)?;
        Ok(Self {
            engine,
            pool,
            config,
        })
    }

    /// Decode `input` and add every row; blocks until all rows are added
    pub fn import<R: BufRead>(&self, input: R, format: ImportFormat) -> ImportResult<ImportStats> {
        let started = Instant::now();
        let outcome = Arc::new(Mutex::new(Outcome::default()));
        let wg = WaitGroup::new();
        let mut stats = ImportStats::default();
        let mut batch: Vec<MetricRow> = Vec::with_capacity(self.config.batch_size);

        let mut on_rows = |rows: ImportResult<Vec<MetricRow>>, stats: &mut ImportStats| -> ImportResult<()> {
            stats.lines += 1;
            match rows {
                Ok(rows) => {
                    stats.rows_parsed += rows.len() as u64;
                    batch.extend(rows);
                }
                Err(e @ ImportError::Parse { .. }) => {
                    stats.parse_errors += 1;
                    tracing::debug!("skipping malformed input: {}", e);
                    stats.first_parse_error.get_or_insert_with(|| e.to_string());
                }
                Err(e) => return Err(e),
            }
            if batch.len() >= self.config.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.config.batch_size));
                self.submit(full, &outcome, &wg)?;
                stats.batches += 1;
            }
            Ok(())
        };

        let read_result = match format {
            ImportFormat::JsonLines => input.lines().enumerate().try_for_each(|(i, line)| {
                let rows = line
                    .map_err(ImportError::from)
                    .and_then(|l| jsonl::parse_line(&l, i as u64 + 1));
                match rows {
                    Err(ImportError::Io(e)) => Err(ImportError::Io(e)),
                    rows => on_rows(rows, &mut stats),
                }
            }),
            ImportFormat::Csv => {
                let mut reader = csv::reader(input);
                reader.records().enumerate().try_for_each(|(i, record)| {
                    let record = record?;
                    let row = csv::parse_record(&record, i as u64 + 1).map(|r| vec![r]);
                    on_rows(row, &mut stats)
                })
            }
        };
        if read_result.is_ok() && !batch.is_empty() {
            self.submit(std::mem::take(&mut batch), &outcome, &wg)?;
            stats.batches += 1;
        }
        // in-flight batches finish even when reading failed
        wg.wait();
        read_result?;

        let mut outcome = outcome.lock();
        if let Some(e) = outcome.error.take() {
            return Err(e.into());
        }
        stats.ingest = outcome.ingest;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            lines = stats.lines,
            rows = stats.ingest.rows_added,
            parse_errors = stats.parse_errors,
            "Import finished"
        );
        Ok(stats)
    }

    fn submit(&self, rows: Vec<MetricRow>, outcome: &Arc<Mutex<Outcome>>, wg: &WaitGroup) -> ImportResult<()> {
        let engine = self.engine.clone();
        let outcome = outcome.clone();
        let wg = wg.clone();
        let precision_bits = self.config.precision_bits;
        let queued = self.pool.submit(move || {
            let result = engine.add_rows(&rows, precision_bits);
            let mut o = outcome.lock();
            match result {
                Ok(s) => o.ingest += s,
                Err(e) => {
                    tracing::error!(rows = rows.len(), "insert batch failed: {}", e);
                    o.error.get_or_insert(e);
                }
            }
            drop(wg);
        });
        if queued {
            Ok(())
        } else {
            Err(ImportError::Closed)
        }
    }

    /// Batches inserted since the importer started
    pub fn completed_batches(&self) -> u64 {
        self.pool.completed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TagFilter;
    use crate::storage::{SearchContext, StorageConfig, TimeRange};
    use tempfile::TempDir;

    fn importer(batch_size: usize) -> (Importer, Arc<StorageEngine>, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            retention_months: 100 * 12,
            small_merge_concurrency: 1,
            big_merge_concurrency: 1,
            ..StorageConfig::new(dir.path())
        };
        let engine = Arc::new(StorageEngine::open(config).unwrap());
        let importer = Importer::new(
            engine.clone(),
            ImporterConfig {
                workers: 2,
                queue_size: 1,
                batch_size,
                precision_bits: 64,
            },
        )
        .unwrap();
        (importer, engine, dir)
    }

    #[test]
    fn test_import_json_lines() {
        let (importer, engine, _dir) = importer(3);
        let mut input = String::new();
        for host in 0..10 {
            input.push_str(&format!(
                "{{\"metric\":{{\"__name__\":\"cpu\",\"host\":\"h{}\"}},\"values\":[1,2],\"timestamps\":[1000,2000]}}\n",
                host
            ));
        }
        input.push_str("garbage\n");
        let stats = importer.import(input.as_bytes(), ImportFormat::JsonLines).unwrap();
        assert_eq!(stats.lines, 11);
        assert_eq!(stats.rows_parsed, 20);
        assert_eq!(stats.parse_errors, 1);
        assert!(stats.first_parse_error.unwrap().starts_with("line 11"));
        assert_eq!(stats.ingest.rows_added, 20);
        assert_eq!(stats.batches, 5);
        assert_eq!(engine.series_count(), 10);
    }

    #[test]
    fn test_import_csv() {
        let (importer, engine, _dir) = importer(100);
        let input = "\"mem{host=\"\"a\"\"}\",1000,1\n\"mem{host=\"\"a\"\"}\",2000,2\nmem,bad,1\n";
        let stats = importer.import(input.as_bytes(), ImportFormat::Csv).unwrap();
        assert_eq!(stats.ingest.rows_added, 2);
        assert_eq!(stats.parse_errors, 1);
        let series: Vec<_> = engine
            .search(&[TagFilter::metric("mem")], &TimeRange::all(), SearchContext::new())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_invalid_precision_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(StorageEngine::open(StorageConfig::new(dir.path())).unwrap());
        let config = ImporterConfig {
            precision_bits: 0,
            ..ImporterConfig::default()
        };
        assert!(matches!(
            Importer::new(engine, config),
            Err(ImportError::Storage(StorageError::InvalidPrecisionBits(0)))
        ));
    }

    #[test]
    fn test_format_names() {
        assert_eq!("jsonl".parse::<ImportFormat>().unwrap(), ImportFormat::JsonLines);
        assert_eq!("CSV".parse::<ImportFormat>().unwrap(), ImportFormat::Csv);
        assert!("xml".parse::<ImportFormat>().is_err());
    }
}
