//! Feeders supply per-iteration attribute rows to virtual users.
//!
//! A compiled `feed` step pulls one row per chain iteration and merges it into
//! the session. Circular, random, and generated feeders never run out; a
//! sequential feeder is finite and raises the exit sentinel once exhausted.
//! All factory-built feeders are safe to share across concurrent users.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use thiserror::Error;

/// Abstract source of key/value rows.
pub trait Feeder: Send + Sync {
    fn name(&self) -> &str;

    /// Whether another row is available. Infinite feeders always return true.
    fn has_next(&self) -> bool;

    /// Yield the next row, or `None` if the feeder is exhausted.
    fn next_row(&self) -> Option<FeederRow>;
}

#[derive(Debug, Error)]
pub enum FeederError {
    #[error("failed to read feeder file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("feeder data must have a header row and at least one data row")]
    TooFewRows,
}

pub type FeederRow = HashMap<String, Value>;

/// Rows served in order, wrapping around when exhausted.
pub fn circular(name: impl Into<String>, rows: Vec<FeederRow>) -> Arc<dyn Feeder> {
    Arc::new(CircularFeeder {
        name: name.into(),
        rows,
        index: AtomicUsize::new(0),
    })
}

/// Rows picked uniformly at random on every call.
pub fn random(name: impl Into<String>, rows: Vec<FeederRow>) -> Arc<dyn Feeder> {
    Arc::new(RandomFeeder {
        name: name.into(),
        rows,
    })
}

/// Rows generated on demand from per-key suppliers.
pub fn generated(
    name: impl Into<String>,
    generators: Vec<(String, Box<dyn Fn() -> Value + Send + Sync>)>,
) -> Arc<dyn Feeder> {
    Arc::new(GeneratedFeeder {
        name: name.into(),
        generators,
    })
}

/// Rows served exactly once, in order. Exhausts after the last row; the
/// compiled feed step turns exhaustion into the exit sentinel.
pub fn sequential(name: impl Into<String>, rows: Vec<FeederRow>) -> Arc<dyn Feeder> {
    Arc::new(SequentialFeeder {
        name: name.into(),
        rows,
        index: AtomicUsize::new(0),
    })
}

/// Circular feeder backed by a CSV file. The first row is treated as headers.
pub fn csv(path: impl AsRef<Path>) -> Result<Arc<dyn Feeder>, FeederError> {
    csv_with_delimiter(path, ",")
}

/// Circular CSV feeder with a custom delimiter.
pub fn csv_with_delimiter(
    path: impl AsRef<Path>,
    delimiter: &str,
) -> Result<Arc<dyn Feeder>, FeederError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| FeederError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let rows = parse_csv(&content, delimiter)?;
    Ok(circular(name, rows))
}

/// Circular feeder from CSV content already in memory.
pub fn csv_str(name: impl Into<String>, content: &str) -> Result<Arc<dyn Feeder>, FeederError> {
    let rows = parse_csv(content, ",")?;
    Ok(circular(name, rows))
}

fn parse_csv(content: &str, delimiter: &str) -> Result<Vec<FeederRow>, FeederError> {
    let mut lines = content.lines();
    let headers: Vec<String> = match lines.next() {
        Some(header) => header
            .split(delimiter)
            .map(|h| h.trim().to_string())
            .collect(),
        None => return Err(FeederError::TooFewRows),
    };

    let mut rows = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let values: Vec<&str> = line.split(delimiter).collect();
        let mut row = FeederRow::new();
        for (header, value) in headers.iter().zip(values.iter()) {
            row.insert(header.clone(), Value::from(value.trim()));
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(FeederError::TooFewRows);
    }
    Ok(rows)
}

struct CircularFeeder {
    name: String,
    rows: Vec<FeederRow>,
    index: AtomicUsize,
}

impl Feeder for CircularFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_next(&self) -> bool {
        true
    }

    fn next_row(&self) -> Option<FeederRow> {
        let i = self.index.fetch_add(1, Ordering::Relaxed) % self.rows.len();
        Some(self.rows[i].clone())
    }
}

struct RandomFeeder {
    name: String,
    rows: Vec<FeederRow>,
}

impl Feeder for RandomFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_next(&self) -> bool {
        true
    }

    fn next_row(&self) -> Option<FeederRow> {
        let i = rand::thread_rng().gen_range(0..self.rows.len());
        Some(self.rows[i].clone())
    }
}

struct GeneratedFeeder {
    name: String,
    generators: Vec<(String, Box<dyn Fn() -> Value + Send + Sync>)>,
}

impl Feeder for GeneratedFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_next(&self) -> bool {
        true
    }

    fn next_row(&self) -> Option<FeederRow> {
        let mut row = FeederRow::new();
        for (key, supplier) in &self.generators {
            row.insert(key.clone(), supplier());
        }
        Some(row)
    }
}

struct SequentialFeeder {
    name: String,
    rows: Vec<FeederRow>,
    index: AtomicUsize,
}

impl Feeder for SequentialFeeder {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_next(&self) -> bool {
        self.index.load(Ordering::Relaxed) < self.rows.len()
    }

    fn next_row(&self) -> Option<FeederRow> {
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        self.rows.get(i).cloned()
    }
}
