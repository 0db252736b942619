//! Connector contract plus the per-source connectors and catalog entries.

use std::path::PathBuf;

use async_trait::async_trait;
use footprint_core::{
    BoundSemantics, ParentLink, Since, SourceDefinition, SourceId, SourceRecord, StreamOrder,
};
use footprint_storage::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, HttpRequest};
use thiserror::Error;

pub mod bundle;
pub mod json;
pub mod sources;

pub use bundle::{bundle_path, BundleConnector, ExportBundle};
pub use sources::definition_for;

pub const CRATE_NAME: &str = "footprint-adapters";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("{source_id} is not configured: {hint}")]
    Config { source_id: SourceId, hint: String },
    #[error("{source_id} rejected the credentials: {message}")]
    Auth { source_id: SourceId, message: String },
    #[error("{source_id} is temporarily unavailable: {message}")]
    Transient { source_id: SourceId, message: String },
    #[error("unexpected response from {source_id}: {message}")]
    Malformed { source_id: SourceId, message: String },
    #[error("reading {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectorError {
    pub fn from_fetch(source_id: SourceId, err: FetchError) -> Self {
        match err {
            FetchError::Unauthorized { .. } => ConnectorError::Auth {
                source_id,
                message: err.to_string(),
            },
            ref e if e.is_transient() => ConnectorError::Transient {
                source_id,
                message: err.to_string(),
            },
            _ => ConnectorError::Malformed {
                source_id,
                message: err.to_string(),
            },
        }
    }

    pub fn malformed(source_id: SourceId, message: impl Into<String>) -> Self {
        ConnectorError::Malformed {
            source_id,
            message: message.into(),
        }
    }
}

/// Position inside a paginated stream, as understood by the connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    Offset(usize),
    Cursor(String),
    Url(String),
}

/// One independently watermarked sequence of records within a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Watermark key in the source's `sync_state` table.
    pub name: String,
    /// Entity the stream primarily yields.
    pub entity: &'static str,
    pub order: StreamOrder,
    pub bound: BoundSemantics,
    /// Upstream page size; a page with fewer upstream items is the last one.
    pub page_size: Option<usize>,
    /// Connector-specific sub-resource, e.g. a repository name.
    pub scope: Option<String>,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, entity: &'static str) -> Self {
        Self {
            name: name.into(),
            entity,
            order: StreamOrder::Descending,
            bound: BoundSemantics::Exclusive,
            page_size: None,
            scope: None,
        }
    }

    pub fn ascending(mut self) -> Self {
        self.order = StreamOrder::Ascending;
        self
    }

    pub fn inclusive(mut self) -> Self {
        self.bound = BoundSemantics::Inclusive;
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<SourceRecord>,
    pub next: Option<PageToken>,
    /// Raw upstream items behind `items`; one upstream item may yield
    /// several records or none.
    pub upstream_count: usize,
}

impl Page {
    pub fn new(items: Vec<SourceRecord>, next: Option<PageToken>) -> Self {
        let upstream_count = items.len();
        Self {
            items,
            next,
            upstream_count,
        }
    }

    pub fn with_upstream_count(mut self, count: usize) -> Self {
        self.upstream_count = count;
        self
    }
}

/// A source's fetch side. Connectors retry transient failures themselves
/// and report what is left as `ConnectorError::Transient`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn source(&self) -> SourceId;

    async fn validate_credentials(&self) -> Result<(), ConnectorError>;

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError>;

    /// Fetches one page of `stream` strictly newer than `since`.
    async fn fetch_page(
        &self,
        stream: &StreamSpec,
        since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError>;

    /// Looks up a parent the store does not hold yet. `None` lets the caller
    /// fall back to the attributes embedded in the dependent record.
    async fn resolve_parent(&self, _link: &ParentLink) -> Result<Option<SourceRecord>, ConnectorError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub readwise_token: Option<String>,
    pub foursquare_token: Option<String>,
    pub foursquare_api_key: Option<String>,
    pub github_token: Option<String>,
    pub github_username: Option<String>,
    pub hardcover_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub credentials: Credentials,
    /// Directory holding `<source>/export.json` bundles.
    pub import_dir: PathBuf,
    pub http: HttpClientConfig,
}

pub(crate) fn require(
    source_id: SourceId,
    value: &Option<String>,
    env_var: &str,
) -> Result<String, ConnectorError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConnectorError::Config {
            source_id,
            hint: format!("set {env_var} in .env"),
        }),
    }
}

pub(crate) fn http_fetcher(
    source_id: SourceId,
    base: &HttpClientConfig,
    min_interval: std::time::Duration,
) -> Result<HttpFetcher, ConnectorError> {
    let config = HttpClientConfig {
        min_interval,
        ..base.clone()
    };
    HttpFetcher::new(config).map_err(|err| ConnectorError::Config {
        source_id,
        hint: format!("building HTTP client: {err:#}"),
    })
}

pub(crate) async fn send(
    http: &HttpFetcher,
    source_id: SourceId,
    request: &HttpRequest,
) -> Result<FetchedResponse, ConnectorError> {
    http.send(source_id.as_str(), request)
        .await
        .map_err(|err| ConnectorError::from_fetch(source_id, err))
}

pub(crate) async fn fetch_json(
    http: &HttpFetcher,
    source_id: SourceId,
    request: &HttpRequest,
) -> Result<serde_json::Value, ConnectorError> {
    send(http, source_id, request)
        .await?
        .json()
        .map_err(|err| ConnectorError::from_fetch(source_id, err))
}

pub(crate) fn unknown_stream(source_id: SourceId, stream: &StreamSpec) -> ConnectorError {
    ConnectorError::malformed(source_id, format!("unknown stream `{}`", stream.name))
}

pub fn connector_for_source(
    source: SourceId,
    settings: &ConnectorSettings,
) -> Result<Box<dyn Connector>, ConnectorError> {
    Ok(match source {
        SourceId::Readwise => Box::new(sources::readwise::ReadwiseConnector::new(settings)?),
        SourceId::Foursquare => Box::new(sources::foursquare::FoursquareConnector::new(settings)?),
        SourceId::Letterboxd => Box::new(sources::letterboxd::connector(settings)),
        SourceId::Overcast => Box::new(sources::overcast::connector(settings)),
        SourceId::Strong => Box::new(sources::strong::connector(settings)),
        SourceId::Hardcover => Box::new(sources::hardcover::HardcoverConnector::new(settings)?),
        SourceId::Github => Box::new(sources::github::GithubConnector::new(settings)?),
    })
}

/// Definition and connector of one source.
pub struct SourcePlugin {
    pub definition: &'static SourceDefinition,
    pub connector: Box<dyn Connector>,
}

pub fn source_plugin(
    source: SourceId,
    settings: &ConnectorSettings,
) -> Result<SourcePlugin, ConnectorError> {
    Ok(SourcePlugin {
        definition: definition_for(source),
        connector: connector_for_source(source, settings)?,
    })
}
