//! Common entity model shared by every history reconstructor.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "flowlog-core";

/// Priority used when a defect records neither a priority change nor a current priority.
pub const UNKNOWN_PRIORITY: &str = "Unknown";

/// Changelog field whose events become release markers in demand history.
pub const RELEASE_MARKER_FIELD: &str = "Fix Version";

/// Lifecycle entry behaviour shared by defect and demand history.
pub trait HistoryEntry {
    fn status_value(&self) -> &str;
    fn start_date(&self) -> DateTime<Utc>;
    fn change_date(&self) -> Option<DateTime<Utc>>;
    fn close(&mut self, at: DateTime<Utc>);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefectHistoryEntry {
    pub priority_value: String,
    pub status_value: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub change_date: Option<DateTime<Utc>>,
}

impl DefectHistoryEntry {
    pub fn new(
        priority_value: impl Into<String>,
        status_value: impl Into<String>,
        start_date: DateTime<Utc>,
    ) -> Self {
        Self {
            priority_value: priority_value.into(),
            status_value: status_value.into(),
            start_date,
            change_date: None,
        }
    }
}

impl HistoryEntry for DefectHistoryEntry {
    fn status_value(&self) -> &str {
        &self.status_value
    }

    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn change_date(&self) -> Option<DateTime<Utc>> {
        self.change_date
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.change_date = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DemandHistoryEntry {
    pub status_value: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub change_date: Option<DateTime<Utc>>,
}

impl DemandHistoryEntry {
    pub fn new(status_value: impl Into<String>, start_date: DateTime<Utc>) -> Self {
        Self {
            status_value: status_value.into(),
            start_date,
            change_date: None,
        }
    }

    /// Synthetic entry that only bounds the end time of the entry before it.
    pub fn release_marker(version: &str, start_date: DateTime<Utc>) -> Self {
        Self::new(format!("{RELEASE_MARKER_FIELD}-{version}"), start_date)
    }

    pub fn is_release_marker(&self) -> bool {
        self.status_value
            .strip_prefix(RELEASE_MARKER_FIELD)
            .is_some_and(|rest| rest.starts_with('-'))
    }
}

impl HistoryEntry for DemandHistoryEntry {
    fn status_value(&self) -> &str {
        &self.status_value
    }

    fn start_date(&self) -> DateTime<Utc> {
        self.start_date
    }

    fn change_date(&self) -> Option<DateTime<Utc>> {
        self.change_date
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.change_date = Some(at);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContinuityError {
    #[error("history for {id} is empty")]
    Empty { id: String },
    #[error("history for {id} starts at {actual}, expected creation time {expected}")]
    FirstStart {
        id: String,
        expected: DateTime<Utc>,
        actual: DateTime<Utc>,
    },
    #[error("history for {id} has a gap at entry {index}: closed {closed:?}, next starts {next_start}")]
    Gap {
        id: String,
        index: usize,
        closed: Option<DateTime<Utc>>,
        next_start: DateTime<Utc>,
    },
    #[error("history for {id} has no open entry at the end")]
    ClosedTail { id: String },
}

/// One reconstructed work item: identity, origin and ordered lifecycle history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonEntry<H> {
    pub id: String,
    #[serde(default)]
    pub uri: Option<String>,
    pub history: Vec<H>,
}

pub type CommonDefectEntry = CommonEntry<DefectHistoryEntry>;
pub type CommonDemandEntry = CommonEntry<DemandHistoryEntry>;

impl<H> CommonEntry<H> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: None,
            history: Vec::new(),
        }
    }
}

impl<H: HistoryEntry> CommonEntry<H> {
    /// Closes the open entry at `at` and freezes it into history.
    pub fn push_closed(&mut self, mut open: H, at: DateTime<Utc>) {
        open.close(at);
        self.history.push(open);
    }

    /// Appends the entry that is still current at reconstruction time.
    pub fn push_open(&mut self, open: H) {
        self.history.push(open);
    }

    pub fn check_continuity(&self, created_at: DateTime<Utc>) -> Result<(), ContinuityError> {
        let Some(first) = self.history.first() else {
            return Err(ContinuityError::Empty {
                id: self.id.clone(),
            });
        };
        if first.start_date() != created_at {
            return Err(ContinuityError::FirstStart {
                id: self.id.clone(),
                expected: created_at,
                actual: first.start_date(),
            });
        }
        for (index, pair) in self.history.windows(2).enumerate() {
            if pair[0].change_date() != Some(pair[1].start_date()) {
                return Err(ContinuityError::Gap {
                    id: self.id.clone(),
                    index,
                    closed: pair[0].change_date(),
                    next_start: pair[1].start_date(),
                });
            }
        }
        match self.history.last() {
            Some(last) if last.change_date().is_some() => Err(ContinuityError::ClosedTail {
                id: self.id.clone(),
            }),
            _ => Ok(()),
        }
    }
}

/// Reconstructed item of either entity kind, as handed to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommonRecord {
    Defect(CommonDefectEntry),
    Demand(CommonDemandEntry),
}

/// Flattened history row used by tabular exports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub item_id: String,
    pub seq: u32,
    pub status_value: String,
    pub priority_value: Option<String>,
    pub start_date: DateTime<Utc>,
    pub change_date: Option<DateTime<Utc>>,
}

impl CommonRecord {
    pub fn id(&self) -> &str {
        match self {
            Self::Defect(entry) => &entry.id,
            Self::Demand(entry) => &entry.id,
        }
    }

    /// Continuity anchored at the first entry's start, for callers that no
    /// longer hold the source's creation timestamp.
    pub fn check_continuity(&self) -> Result<(), ContinuityError> {
        match self {
            Self::Defect(entry) => entry.check_continuity(first_start(entry)?),
            Self::Demand(entry) => entry.check_continuity(first_start(entry)?),
        }
    }

    pub fn history_rows(&self) -> Vec<HistoryRow> {
        match self {
            Self::Defect(entry) => entry
                .history
                .iter()
                .zip(0u32..)
                .map(|(h, seq)| HistoryRow {
                    item_id: entry.id.clone(),
                    seq,
                    status_value: h.status_value.clone(),
                    priority_value: Some(h.priority_value.clone()),
                    start_date: h.start_date,
                    change_date: h.change_date,
                })
                .collect(),
            Self::Demand(entry) => entry
                .history
                .iter()
                .zip(0u32..)
                .map(|(h, seq)| HistoryRow {
                    item_id: entry.id.clone(),
                    seq,
                    status_value: h.status_value.clone(),
                    priority_value: None,
                    start_date: h.start_date,
                    change_date: h.change_date,
                })
                .collect(),
        }
    }
}

fn first_start<H: HistoryEntry>(entry: &CommonEntry<H>) -> Result<DateTime<Utc>, ContinuityError> {
    entry
        .history
        .first()
        .map(HistoryEntry::start_date)
        .ok_or_else(|| ContinuityError::Empty {
            id: entry.id.clone(),
        })
}

/// Parses tracker timestamps: RFC 3339, numeric offsets without a colon
/// (`2017-03-01T10:00:00.000-0500`), or naive values taken as UTC.
pub fn parse_source_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
