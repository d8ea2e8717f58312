/// Per-sample statistics table, one CSV file per element.
///
/// The table is updated incrementally: samples already present in an
/// existing file keep their row, new samples are appended.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::matrix::{percentile_of_sorted, ElementMatrix};
use crate::data::samples::{column_index, csv_field, read_csv_records, SampleAliases};
use crate::error::{MapError, Result};
use crate::pipeline::normalize::round_significant;

pub const STATS_COLUMNS: [&str; 8] = [
    "Sample",
    "25th Percentile",
    "50th Percentile",
    "75th Percentile",
    "99th Percentile",
    "IQR",
    "Mean",
    "Alias",
];

/// Significant digits kept in the written table.
const SIG_DIGITS: i32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct SampleStats {
    pub sample: String,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p99: f64,
    pub iqr: f64,
    pub mean: f64,
    pub alias: String,
}

impl SampleStats {
    pub fn compute(matrix: &ElementMatrix, alias: &str) -> Result<Self> {
        let sorted = matrix.grid.sorted_valid();
        let pct = |p: f64| percentile_of_sorted(&sorted, p);
        let (Some(p25), Some(p50), Some(p75), Some(p99), Some(mean)) =
            (pct(25.0), pct(50.0), pct(75.0), pct(99.0), matrix.grid.mean())
        else {
            return Err(MapError::data(format!(
                "{} {} has no values for statistics",
                matrix.sample(),
                matrix.element()
            )));
        };
        Ok(Self {
            sample: matrix.sample().to_string(),
            p25,
            p50,
            p75,
            p99,
            iqr: p75 - p25,
            mean,
            alias: alias.to_string(),
        })
    }

    fn values(&self) -> [f64; 6] {
        [self.p25, self.p50, self.p75, self.p99, self.iqr, self.mean]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsTable {
    rows: Vec<SampleStats>,
}

impl StatsTable {
    /// `{dir}/{key}_statistics.csv`
    pub fn path_for(element_dir: &Path, key: &str) -> PathBuf {
        element_dir.join(format!("{}_statistics.csv", key))
    }

    /// Read an existing table; a missing file gives an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let (header, records) = read_csv_records(&text);
        let Some(si) = column_index(&header, "Sample") else {
            return Err(MapError::data(format!("{} has no 'Sample' column", path.display())));
        };
        let idx: Vec<Option<usize>> = STATS_COLUMNS[1..7]
            .iter()
            .map(|c| column_index(&header, c))
            .collect();
        let alias_idx = column_index(&header, "Alias");

        let mut rows = Vec::with_capacity(records.len());
        for rec in records {
            let Some(sample) = rec.get(si).filter(|s| !s.is_empty()) else {
                continue;
            };
            let num = |k: usize| {
                idx[k]
                    .and_then(|i| rec.get(i))
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(f64::NAN)
            };
            let alias = alias_idx
                .and_then(|i| rec.get(i))
                .filter(|a| !a.is_empty())
                .cloned()
                .unwrap_or_else(|| sample.clone());
            rows.push(SampleStats {
                sample: sample.clone(),
                p25: num(0),
                p50: num(1),
                p75: num(2),
                p99: num(3),
                iqr: num(4),
                mean: num(5),
                alias,
            });
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[SampleStats] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, sample: &str) -> bool {
        self.rows.iter().any(|r| r.sample == sample)
    }

    pub fn samples(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.sample.as_str()).collect()
    }

    /// Append rows for samples not yet in the table; returns how many were
    /// added.
    pub fn merge_new(&mut self, new: impl IntoIterator<Item = SampleStats>) -> usize {
        let mut added = 0;
        for row in new {
            if !self.contains(&row.sample) {
                self.rows.push(row);
                added += 1;
            }
        }
        added
    }

    /// Refresh the alias column from an alias table.
    pub fn apply_aliases(&mut self, aliases: &SampleAliases) {
        for row in &mut self.rows {
            row.alias = aliases.display_name(&row.sample).to_string();
        }
    }

    pub fn to_csv(&self) -> String {
        let mut out = STATS_COLUMNS.join(",");
        out.push('\n');
        for row in &self.rows {
            out.push_str(&csv_field(&row.sample));
            for v in row.values() {
                out.push(',');
                if v.is_finite() {
                    out.push_str(&format!("{}", round_significant(v, SIG_DIGITS)));
                }
            }
            out.push(',');
            out.push_str(&csv_field(&row.alias));
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv())?;
        log::info!("Statistics for {} sample(s) written to {}", self.rows.len(), path.display());
        Ok(())
    }
}
