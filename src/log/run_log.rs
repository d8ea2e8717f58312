/// Processing log for a batch run
///
/// Every step of a run is recorded in order with:
/// - Timestamp
/// - Operation name
/// - What was done (element, sample counts, output files)
///
/// Failed elements are collected separately so the run can end with a
/// summary. The log is written next to the outputs as text and as JSON.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

pub const LOG_TEXT_FILE: &str = "processing_log.txt";
pub const LOG_JSON_FILE: &str = "processing_log.json";

/// One recorded step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based position in the run
    pub sequence: usize,
    pub timestamp: DateTime<Local>,
    pub operation: String,
    pub description: String,
}

impl LogEntry {
    pub fn to_text(&self) -> String {
        format!(
            "[{:03}] {} | {} | {}",
            self.sequence,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.operation,
            self.description,
        )
    }
}

/// An element group that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub element: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub session_id: String,
    pub session_start: DateTime<Local>,
    pub input_dir: String,
    pub output_dir: String,
    pub software_version: String,
    pub entries: Vec<LogEntry>,
    pub failures: Vec<Failure>,
}

impl RunLog {
    pub fn new(input_dir: &Path, output_dir: &Path) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            session_start: Local::now(),
            input_dir: input_dir.display().to_string(),
            output_dir: output_dir.display().to_string(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            entries: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, operation: &str, description: &str) {
        let seq = self.entries.len() + 1;
        self.entries.push(LogEntry {
            sequence: seq,
            timestamp: Local::now(),
            operation: operation.to_string(),
            description: description.to_string(),
        });
        log::info!("[{:03}] {}: {}", seq, operation, description);
    }

    pub fn add_failure(&mut self, element: &str, reason: &str) {
        log::error!("{} failed: {}", element, reason);
        self.failures.push(Failure {
            element: element.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Append another log's steps (renumbered) and failures.
    pub fn absorb(&mut self, other: RunLog) {
        for mut entry in other.entries {
            entry.sequence = self.entries.len() + 1;
            self.entries.push(entry);
        }
        self.failures.extend(other.failures);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// One line per failed element, or a note that everything succeeded.
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return format!("All elements processed ({} steps)", self.entries.len());
        }
        let mut out = format!("{} element(s) failed:\n", self.failures.len());
        for f in &self.failures {
            out.push_str(&format!("  - {}: {}\n", f.element, f.reason));
        }
        out
    }

    pub fn to_text(&self) -> String {
        let rule = "===============================================================\n";
        let mut out = String::new();
        out.push_str(rule);
        out.push_str("  Element Map Processing Log\n");
        out.push_str(rule);
        out.push_str(&format!("  Session ID:  {}\n", self.session_id));
        out.push_str(&format!(
            "  Started:     {}\n",
            self.session_start.format("%Y-%m-%d %H:%M:%S")
        ));
        out.push_str(&format!("  Input:       {}\n", self.input_dir));
        out.push_str(&format!("  Output:      {}\n", self.output_dir));
        out.push_str(&format!("  Software:    elemap v{}\n", self.software_version));
        out.push_str(&format!("  Operations:  {}\n", self.entries.len()));
        out.push_str("---------------------------------------------------------------\n\n");

        for entry in &self.entries {
            out.push_str(&entry.to_text());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.summary());
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(rule);
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write `processing_log.txt` and `processing_log.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join(LOG_TEXT_FILE), self.to_text())?;
        std::fs::write(dir.join(LOG_JSON_FILE), self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_log() -> RunLog {
        RunLog::new(Path::new("in"), Path::new("out"))
    }

    #[test]
    fn test_entries_are_numbered() {
        let mut log = new_log();
        assert!(log.is_empty());
        log.add_entry("Load", "3 matrices for Fe56_ppm");
        log.add_entry("Composite", "Fe56_ppm_composite.png");
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries[1].sequence, 2);
    }

    #[test]
    fn test_absorb_renumbers() {
        let mut main = new_log();
        main.add_entry("Scan", "2 groups");
        let mut part = new_log();
        part.add_entry("Load", "Zn66_cps");
        part.add_failure("Cu63_ppm", "no values");
        main.absorb(part);
        assert_eq!(main.entries[1].sequence, 2);
        assert!(main.has_failures());
    }

    #[test]
    fn test_summary_lists_failures() {
        let mut log = new_log();
        assert!(log.summary().starts_with("All elements processed"));
        log.add_failure("Fe56_ppm", "data error: empty");
        log.add_failure("TotalMo_raw", "file not found: x");
        let s = log.summary();
        assert!(s.contains("2 element(s) failed"));
        assert!(s.contains("Fe56_ppm: data error: empty"));
        assert!(log.to_text().contains("TotalMo_raw"));
    }

    #[test]
    fn test_save_writes_text_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = new_log();
        log.add_entry("Stats", "2 new samples");
        log.save(dir.path()).unwrap();
        let json = std::fs::read_to_string(dir.path().join(LOG_JSON_FILE)).unwrap();
        let parsed: RunLog = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert!(dir.path().join(LOG_TEXT_FILE).exists());
    }
}
