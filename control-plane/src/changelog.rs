//! Append-only mission changelog.
//!
//! One line per notable event. Every failure gets a line carrying the
//! unit id, failure kind, a short summary, and a pointer to the
//! workspace that held the attempt. Lines parse back into entries for
//! status displays.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::ControlResult;

/// Entry category markers as they appear in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangelogMarker {
    MissionStart,
    EpochStart,
    Merge,
    Promote,
    Fail,
    Fixup,
    Stale,
    Stop,
}

impl ChangelogMarker {
    fn as_str(self) -> &'static str {
        match self {
            Self::MissionStart => "START",
            Self::EpochStart => "EPOCH",
            Self::Merge => "MERGE",
            Self::Promote => "GREEN",
            Self::Fail => "FAIL",
            Self::Fixup => "FIXUP",
            Self::Stale => "STALE",
            Self::Stop => "STOP",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "START" => Some(Self::MissionStart),
            "EPOCH" => Some(Self::EpochStart),
            "MERGE" => Some(Self::Merge),
            "GREEN" => Some(Self::Promote),
            "FAIL" => Some(Self::Fail),
            "FIXUP" => Some(Self::Fixup),
            "STALE" => Some(Self::Stale),
            "STOP" => Some(Self::Stop),
            _ => None,
        }
    }
}

/// One parsed changelog line.
#[derive(Debug, Clone)]
pub struct ChangelogEntry {
    pub timestamp: DateTime<Utc>,
    pub marker: ChangelogMarker,
    pub unit_id: Option<String>,
    pub kind: Option<String>,
    pub workspace: Option<String>,
    pub summary: String,
}

impl ChangelogEntry {
    fn new(marker: ChangelogMarker, summary: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            marker,
            unit_id: None,
            kind: None,
            workspace: None,
            summary: summary.into(),
        }
    }

    fn to_log_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.timestamp.to_rfc3339(),
            self.marker.as_str(),
            self.unit_id.as_deref().unwrap_or(""),
            self.kind.as_deref().unwrap_or(""),
            self.workspace.as_deref().unwrap_or(""),
            self.summary.replace('\n', " "),
        )
    }

    fn from_log_line(line: &str) -> Option<Self> {
        let mut parts = line.splitn(6, '|');
        let timestamp = DateTime::parse_from_rfc3339(parts.next()?)
            .ok()?
            .with_timezone(&Utc);
        let marker = ChangelogMarker::parse(parts.next()?)?;
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let unit_id = non_empty(parts.next()?);
        let kind = non_empty(parts.next()?);
        let workspace = non_empty(parts.next()?);
        let summary = parts.next()?.to_string();
        Some(Self {
            timestamp,
            marker,
            unit_id,
            kind,
            workspace,
            summary,
        })
    }
}

/// Appender for the mission changelog file.
pub struct MissionChangelog {
    path: PathBuf,
}

impl MissionChangelog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn append(&self, entry: &ChangelogEntry) -> ControlResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", entry.to_log_line())?;
        Ok(())
    }

    /// Read every parseable entry.
    pub fn read_all(&self) -> ControlResult<Vec<ChangelogEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| ChangelogEntry::from_log_line(&line))
            .collect())
    }

    /// Read the last `n` entries.
    pub fn read_last(&self, n: usize) -> ControlResult<Vec<ChangelogEntry>> {
        let mut entries = self.read_all()?;
        let skip = entries.len().saturating_sub(n);
        Ok(entries.split_off(skip))
    }

    pub fn log_mission_start(&self, mission_id: &str, objective: &str) -> ControlResult<()> {
        let mut entry =
            ChangelogEntry::new(ChangelogMarker::MissionStart, format!("objective: {objective}"));
        entry.unit_id = Some(mission_id.to_string());
        self.append(&entry)
    }

    pub fn log_epoch_start(&self, ordinal: u32, planned: usize) -> ControlResult<()> {
        self.append(&ChangelogEntry::new(
            ChangelogMarker::EpochStart,
            format!("epoch {ordinal}: {planned} units planned"),
        ))
    }

    /// The one-line-per-failure contract.
    pub fn log_failure(
        &self,
        unit_id: &str,
        kind: &str,
        summary: &str,
        workspace: Option<&Path>,
    ) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(ChangelogMarker::Fail, summary);
        entry.unit_id = Some(unit_id.to_string());
        entry.kind = Some(kind.to_string());
        entry.workspace = workspace.map(|p| p.display().to_string());
        self.append(&entry)
    }

    pub fn log_merge(&self, unit_id: &str, summary: &str) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(ChangelogMarker::Merge, summary);
        entry.unit_id = Some(unit_id.to_string());
        self.append(&entry)
    }

    pub fn log_promotion(&self, unit_id: &str, green_sha: &str) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(
            ChangelogMarker::Promote,
            format!("mc/green -> {green_sha}"),
        );
        entry.unit_id = Some(unit_id.to_string());
        self.append(&entry)
    }

    pub fn log_fixup(&self, unit_id: &str, candidates: usize, winner: Option<usize>) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(
            ChangelogMarker::Fixup,
            match winner {
                Some(idx) => format!("{candidates} candidates, winner #{idx}"),
                None => format!("{candidates} candidates, none viable"),
            },
        );
        entry.unit_id = Some(unit_id.to_string());
        self.append(&entry)
    }

    pub fn log_stale(&self, unit_id: &str, reason: &str) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(ChangelogMarker::Stale, reason);
        entry.unit_id = Some(unit_id.to_string());
        self.append(&entry)
    }

    /// Final line: stop reason plus a cost/progress snapshot.
    pub fn log_stop(
        &self,
        reason: &str,
        total_cost_usd: f64,
        green_sha: Option<&str>,
    ) -> ControlResult<()> {
        let mut entry = ChangelogEntry::new(
            ChangelogMarker::Stop,
            format!(
                "reason={reason} cost=${total_cost_usd:.2} green={}",
                green_sha.unwrap_or("unchanged")
            ),
        );
        entry.kind = Some(reason.to_string());
        self.append(&entry)
    }
}
