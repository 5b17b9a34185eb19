//! Result Logger
//!
//! Durable record of a run as JSON Lines, one object per line, appended to
//! `{log_dir}/{desc}.jsonl`:
//!
//! ```text
//! {"time": 1760000000.1, "elapsed": 0.0, "config": {...}}
//! {"time": 1760000042.7, "elapsed": 42.6, "epoch": 0, "n_updates": 125,
//!  "tr_cost": 211.4, "va_cost": 230.9, "tr_acc": 61.2, "va_acc": 58.7}
//! ...
//! ```
//!
//! `tr_cost`/`va_cost` are perplexities; accuracies are percentages. Every
//! line is flushed as soon as it is written, so a crashed run keeps all
//! evaluations that completed.

use crate::config::TrainingConfig;
use crate::error::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Metrics from one evaluation pass
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvalRecord {
    pub epoch: usize,
    pub n_updates: usize,
    /// Train-subsample perplexity
    pub tr_cost: f32,
    /// Validation perplexity
    pub va_cost: f32,
    pub tr_acc: f32,
    pub va_acc: f32,
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    time: f64,
    elapsed: f32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Serialize)]
struct Header<'a> {
    config: &'a TrainingConfig,
}

/// Append-only JSON Lines writer for run results
pub struct ResultLogger {
    out: BufWriter<File>,
    start_time: Instant,
}

impl ResultLogger {
    /// Open (or create) the log and write a header line with the run config
    pub fn new(path: &Path, config: &TrainingConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut logger = Self {
            out: BufWriter::new(file),
            start_time: Instant::now(),
        };
        logger.write_line(&Header { config })?;
        Ok(logger)
    }

    pub fn log(&mut self, record: &EvalRecord) -> Result<()> {
        self.write_line(record)
    }

    fn write_line<T: Serialize>(&mut self, body: &T) -> Result<()> {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let line = Stamped {
            time,
            elapsed: self.start_time.elapsed().as_secs_f32(),
            body,
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_then_records() {
        let path = std::env::temp_dir()
            .join(format!("baike-gpt-log-{}", std::process::id()))
            .join("run.jsonl");
        let _ = std::fs::remove_file(&path);

        let config = TrainingConfig::default();
        let mut logger = ResultLogger::new(&path, &config).unwrap();
        logger
            .log(&EvalRecord {
                epoch: 1,
                n_updates: 20,
                tr_cost: 30.5,
                va_cost: 35.25,
                tr_acc: 75.0,
                va_acc: 62.5,
            })
            .unwrap();
        drop(logger);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["config"]["desc"], "gpt-baike-qa");
        assert!(lines[0]["time"].as_f64().unwrap() > 0.0);
        assert_eq!(lines[1]["n_updates"], 20);
        assert_eq!(lines[1]["va_cost"], 35.25);

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }
}
