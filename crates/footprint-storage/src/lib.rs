//! Persistence and HTTP plumbing for footprint: per-source SQLite record
//! stores, atomic artifact writes, and a throttled, retrying HTTP fetcher.

pub mod artifacts;
pub mod http;
pub mod store;

pub use artifacts::{ArtifactStore, StoredArtifact};
pub use http::{
    classify_reqwest_error, classify_status, rate_limit_wait, retry_after, BackoffPolicy,
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, HttpRequest, RequestThrottle,
    RetryDisposition,
};
pub use store::{
    format_timestamp, schema_statements, AnalysisRow, AnalysisSummary, Cell, ExistenceCheck,
    Initializable, MetricRow, SourceStore, StoreError, UnitOfWork, UpsertOutcome,
};

pub const CRATE_NAME: &str = "footprint-storage";
