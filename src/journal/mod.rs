//! Drawer journal: JSON lines per watch session.
//!
//! When enabled, every note the drawer produces (opens, closes, hydration
//! starts and outcomes, tab selections, visibility changes, probe results,
//! status transitions) is appended as one self-contained JSON object with an
//! RFC 3339 timestamp. The journal is an audit trail for diagnosing
//! reconciliation behaviour after the fact; nothing reads it back.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::drawer::DrawerNote;
use crate::execution::ExecutionId;

/// One line of the journal.
#[derive(Debug, Serialize)]
pub struct JournalEntry<'a> {
    pub timestamp: String,
    #[serde(flatten)]
    pub note: &'a DrawerNote,
}

/// Append-only JSONL writer.
pub struct Journal {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl Journal {
    /// Open (or create) a journal at `path`, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open journal: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Journal file for one execution under `dir`, named by the
    /// percent-encoded id.
    pub fn for_execution(dir: &Path, execution_id: &ExecutionId) -> Result<Self> {
        Self::new(&dir.join(format!("{}.jsonl", execution_id.percent_encoded())))
    }

    pub fn record(&self, note: &DrawerNote) -> Result<()> {
        let entry = JournalEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            note,
        };
        let json = serde_json::to_string(&entry).context("failed to serialize journal entry")?;

        debug!(entry = %json, "drawer journal");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("journal writer lock poisoned"))?;
        writeln!(writer, "{json}").context("failed to write journal entry")?;
        writer.flush().context("failed to flush journal")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ExecutionStatus;
    use crate::hydration::{HydrationReason, TicketId};
    use crate::tabs::TabId;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn entries_are_tagged_json_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("e1.jsonl");
        let journal = Journal::new(&path).unwrap();

        journal
            .record(&DrawerNote::HydrationStarted {
                ticket: TicketId::new(),
                reason: HydrationReason::Foregrounded,
            })
            .unwrap();
        journal
            .record(&DrawerNote::TabSelected {
                execution_id: Some(ExecutionId::new("e1")),
                tab: TabId::AiAnalysis,
            })
            .unwrap();
        journal.record(&DrawerNote::AuthExpired).unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "hydration_started");
        assert_eq!(lines[0]["data"]["reason"], "foregrounded");
        assert_eq!(lines[1]["event"], "tab_selected");
        assert_eq!(lines[1]["data"]["tab"], "ai-analysis");
        assert_eq!(lines[2]["event"], "auth_expired");
        for line in &lines {
            let ts = line["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
        }
    }

    #[test]
    fn status_serializes_as_api_string() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.jsonl");
        let journal = Journal::new(&path).unwrap();
        journal
            .record(&DrawerNote::StatusChanged {
                from: ExecutionStatus::Running,
                to: ExecutionStatus::Passed,
            })
            .unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines[0]["data"]["from"], "RUNNING");
        assert_eq!(lines[0]["data"]["to"], "PASSED");
    }

    #[test]
    fn creates_parent_directories_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("deep").join("journal");
        let id = ExecutionId::new("run/42");

        {
            let journal = Journal::for_execution(&dir, &id).unwrap();
            journal
                .record(&DrawerNote::Closed {
                    execution_id: id.clone(),
                })
                .unwrap();
        }
        let journal = Journal::for_execution(&dir, &id).unwrap();
        journal.record(&DrawerNote::ArtifactsProbed { count: 2 }).unwrap();

        assert_eq!(journal.path(), dir.join("run%2F42.jsonl"));
        assert_eq!(read_lines(journal.path()).len(), 2);
    }

    #[test]
    fn ids_that_differ_only_in_separators_get_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let slashed = Journal::for_execution(tmp.path(), &ExecutionId::new("run/42")).unwrap();
        let underscored = Journal::for_execution(tmp.path(), &ExecutionId::new("run_42")).unwrap();
        assert_ne!(slashed.path(), underscored.path());

        slashed.record(&DrawerNote::AuthExpired).unwrap();
        underscored.record(&DrawerNote::ArtifactsProbed { count: 1 }).unwrap();
        assert_eq!(read_lines(slashed.path()).len(), 1);
        assert_eq!(read_lines(underscored.path()).len(), 1);
    }
}
