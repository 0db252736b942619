//! Incremental sync, monthly aggregation, reporting and publishing for
//! every footprint source.

pub mod aggregate;
pub mod config;
pub mod orchestrator;
pub mod pipeline;
pub mod publish;
pub mod report;

use footprint_adapters::ConnectorError;
use footprint_core::SourceId;
use footprint_storage::StoreError;
use thiserror::Error;

pub use aggregate::AggregationEngine;
pub use config::AppConfig;
pub use orchestrator::{SyncOptions, SyncOrchestrator};
pub use pipeline::{Pipeline, PublishOutcome, SourceOutcome, SourceStatus};
pub use publish::{Artifact, DirectoryPublisher, PublishReceipt, Publisher};
pub use report::{HistoryEntry, MonthlyReport, ReportBundle, ReportGenerator, SourceSection};

pub const CRATE_NAME: &str = "footprint-sync";

/// Failure of one source's sync or analysis pass. Sibling sources are
/// unaffected.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{source_id} authentication failed: {message}")]
    Auth { source_id: SourceId, message: String },
    #[error("{source_id} is not configured: {hint}")]
    Config { source_id: SourceId, hint: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Connector(ConnectorError),
}

impl SyncError {
    /// The source's state cannot be trusted for the rest of the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth { .. } | SyncError::Config { .. })
    }
}

impl From<ConnectorError> for SyncError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::Auth { source_id, message } => SyncError::Auth { source_id, message },
            ConnectorError::Config { source_id, hint } => SyncError::Config { source_id, hint },
            other => SyncError::Connector(other),
        }
    }
}
