//! Core domain model for footprint: sources, normalized records, watermarks,
//! calendar periods and the period-over-period comparison engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub mod catalog;
pub mod compare;
pub mod period;

pub use catalog::{
    Aggregate, ColumnDef, ColumnType, EmptyValue, EntityDef, MetricDef, MetricQuery, ParentDef,
    SourceDefinition,
};
pub use compare::{
    comparison_suffix, compute_comparisons, format_change, percentage_change, ratio_change,
    MetricChange, MetricMap,
};
pub use period::{comparison_periods, ComparisonPeriods, PeriodError, YearMonth};

pub const CRATE_NAME: &str = "footprint-core";

/// Third-party services footprint knows how to sync, in the fixed order
/// multi-source runs visit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Readwise,
    Foursquare,
    Letterboxd,
    Overcast,
    Strong,
    Hardcover,
    Github,
}

impl SourceId {
    pub const ALL: [SourceId; 7] = [
        SourceId::Readwise,
        SourceId::Foursquare,
        SourceId::Letterboxd,
        SourceId::Overcast,
        SourceId::Strong,
        SourceId::Hardcover,
        SourceId::Github,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Readwise => "readwise",
            SourceId::Foursquare => "foursquare",
            SourceId::Letterboxd => "letterboxd",
            SourceId::Overcast => "overcast",
            SourceId::Strong => "strong",
            SourceId::Hardcover => "hardcover",
            SourceId::Github => "github",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            SourceId::Readwise => "Readwise",
            SourceId::Foursquare => "Foursquare",
            SourceId::Letterboxd => "Letterboxd",
            SourceId::Overcast => "Overcast",
            SourceId::Strong => "Strong",
            SourceId::Hardcover => "Hardcover",
            SourceId::Github => "GitHub",
        }
    }

    /// Activity kind used for published data file names.
    pub fn activity_kind(&self) -> &'static str {
        match self {
            SourceId::Readwise => "reading",
            SourceId::Foursquare => "travel",
            SourceId::Letterboxd => "movies",
            SourceId::Overcast => "podcasts",
            SourceId::Strong => "workouts",
            SourceId::Hardcover => "books",
            SourceId::Github => "code",
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown source `{0}`")]
pub struct UnknownSource(pub String);

impl FromStr for SourceId {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceId::ALL
            .into_iter()
            .find(|source| source.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Reference from a dependent record to the parent it needs in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    pub entity: &'static str,
    /// `None` when the upstream payload carried no usable parent identity.
    pub key: Option<String>,
    /// Parent attributes embedded in the dependent's own payload, if any.
    pub embedded: Option<BTreeMap<String, JsonValue>>,
}

/// Normalized handoff contract from connectors into the sync orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub entity: &'static str,
    pub key: String,
    /// Timestamp contributing to the stream watermark once the record is written.
    pub observed_at: Option<DateTime<Utc>>,
    /// Opaque upstream cursor contributing to the stream watermark.
    pub cursor: Option<String>,
    pub fields: BTreeMap<String, JsonValue>,
    pub parent: Option<ParentLink>,
}

impl SourceRecord {
    pub fn new(entity: &'static str, key: impl Into<String>) -> Self {
        Self {
            entity,
            key: key.into(),
            observed_at: None,
            cursor: None,
            fields: BTreeMap::new(),
            parent: None,
        }
    }

    pub fn observed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Sets a field. A JSON null is kept and clears the stored column.
    pub fn field(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Sets a field the payload carried; `None` means the payload did not
    /// mention it, so the stored value is left alone.
    pub fn field_opt(self, name: &str, value: Option<JsonValue>) -> Self {
        match value {
            Some(value) => self.field(name, value),
            None => self,
        }
    }

    pub fn parent(
        mut self,
        entity: &'static str,
        key: Option<String>,
        embedded: Option<BTreeMap<String, JsonValue>>,
    ) -> Self {
        self.parent = Some(ParentLink {
            entity,
            key,
            embedded,
        });
        self
    }
}

/// Whether an upstream "since" filter includes the bound itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundSemantics {
    Inclusive,
    Exclusive,
}

/// Order in which a connector yields a stream's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamOrder {
    /// Oldest first: every written prefix is contiguous from the watermark.
    Ascending,
    /// Newest first, or no guaranteed order.
    Descending,
}

/// Exclusive lower bound handed to a connector for incremental fetches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Since {
    After(DateTime<Utc>),
    Cursor(String),
}

/// Persisted sync progress of one stream within one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub stream: String,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
}

impl Watermark {
    pub fn empty(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            last_sync_at: None,
            last_cursor: None,
        }
    }

    /// Bound for the next fetch. Inclusive upstreams get the stored timestamp
    /// bumped by one second so the boundary record is not fetched again.
    pub fn since(&self, bound: BoundSemantics) -> Option<Since> {
        if let Some(cursor) = &self.last_cursor {
            return Some(Since::Cursor(cursor.clone()));
        }
        self.last_sync_at.map(|at| match bound {
            BoundSemantics::Inclusive => Since::After(at + Duration::seconds(1)),
            BoundSemantics::Exclusive => Since::After(at),
        })
    }

    /// Returns the advanced watermark, or `None` when `progress` would not
    /// move it forward. Timestamps never regress.
    pub fn advanced_by(&self, progress: &StreamProgress) -> Option<Watermark> {
        let last_sync_at = match (self.last_sync_at, progress.max_observed) {
            (Some(current), Some(seen)) if seen > current => Some(seen),
            (None, Some(seen)) => Some(seen),
            (current, _) => current,
        };
        let last_cursor = progress
            .last_cursor
            .clone()
            .or_else(|| self.last_cursor.clone());

        if last_sync_at == self.last_sync_at && last_cursor == self.last_cursor {
            return None;
        }
        Some(Watermark {
            stream: self.stream.clone(),
            last_sync_at,
            last_cursor,
        })
    }
}

/// Highest timestamp and latest cursor among successfully written records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamProgress {
    pub max_observed: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
}

impl StreamProgress {
    pub fn observe(&mut self, record: &SourceRecord) {
        if let Some(at) = record.observed_at {
            if self.max_observed.map_or(true, |max| at > max) {
                self.max_observed = Some(at);
            }
        }
        if let Some(cursor) = &record.cursor {
            self.last_cursor = Some(cursor.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub items_written: usize,
    pub items_skipped: usize,
    pub parents_created: usize,
    /// A stream stopped early on a transient upstream failure.
    pub interrupted: bool,
}

impl SyncStats {
    pub fn merge(&mut self, other: SyncStats) {
        self.items_written += other.items_written;
        self.items_skipped += other.items_skipped;
        self.parents_created += other.parents_created;
        self.interrupted |= other.interrupted;
    }
}
