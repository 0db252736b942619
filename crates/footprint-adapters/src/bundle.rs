//! Connectors over local export files for services without a usable API.
//!
//! An export bundle is a JSON document with one array of row objects per
//! exported table, produced from the service's own export (CSV or OPML).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use footprint_core::{Since, SourceId, SourceRecord};
use footprint_storage::ArtifactStore;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{Connector, ConnectorError, ConnectorSettings, Page, PageToken, StreamSpec};

pub const EXPORT_STREAM: &str = "export";
const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub source: String,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<JsonValue>>,
}

impl ExportBundle {
    pub fn rows(&self, table: &str) -> &[JsonValue] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn bundle_path(import_dir: &Path, source: SourceId) -> PathBuf {
    import_dir.join(source.as_str()).join("export.json")
}

pub type Normalizer = fn(&ExportBundle) -> Vec<SourceRecord>;

struct LoadedExport {
    content_hash: String,
    records: Vec<SourceRecord>,
}

/// Serves the normalized rows of an export bundle as a single stream. Every
/// record carries the bundle's content hash as its cursor, so an unchanged
/// file yields nothing on the next run.
pub struct BundleConnector {
    source: SourceId,
    path: PathBuf,
    normalize: Normalizer,
    page_size: usize,
    loaded: OnceCell<LoadedExport>,
}

impl BundleConnector {
    pub fn new(source: SourceId, settings: &ConnectorSettings, normalize: Normalizer) -> Self {
        Self {
            source,
            path: bundle_path(&settings.import_dir, source),
            normalize,
            page_size: DEFAULT_PAGE_SIZE,
            loaded: OnceCell::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<&LoadedExport, ConnectorError> {
        self.loaded
            .get_or_try_init(|| async {
                let bytes = tokio::fs::read(&self.path)
                    .await
                    .map_err(|source| ConnectorError::Io {
                        path: self.path.clone(),
                        source,
                    })?;
                let bundle: ExportBundle = serde_json::from_slice(&bytes).map_err(|err| {
                    ConnectorError::malformed(
                        self.source,
                        format!("{}: {err}", self.path.display()),
                    )
                })?;
                let content_hash = ArtifactStore::sha256_hex(&bytes);
                let records = (self.normalize)(&bundle)
                    .into_iter()
                    .map(|record| record.cursor(content_hash.clone()))
                    .collect::<Vec<_>>();
                debug!(
                    source_id = %self.source,
                    records = records.len(),
                    hash = %content_hash,
                    "loaded export bundle"
                );
                Ok(LoadedExport {
                    content_hash,
                    records,
                })
            })
            .await
    }
}

#[async_trait]
impl Connector for BundleConnector {
    fn source(&self) -> SourceId {
        self.source
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            Ok(())
        } else {
            Err(ConnectorError::Config {
                source_id: self.source,
                hint: format!("place the export bundle at {}", self.path.display()),
            })
        }
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        Ok(vec![StreamSpec::new(EXPORT_STREAM, "export").page_size(self.page_size)])
    }

    async fn fetch_page(
        &self,
        _stream: &StreamSpec,
        since: Option<&Since>,
        page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        let loaded = self.load().await?;
        if matches!(since, Some(Since::Cursor(hash)) if *hash == loaded.content_hash) {
            debug!(source_id = %self.source, "export bundle unchanged since last sync");
            return Ok(Page::default());
        }

        let offset = match page {
            None => 0,
            Some(PageToken::Offset(offset)) => *offset,
            Some(other) => {
                return Err(ConnectorError::malformed(
                    self.source,
                    format!("unexpected page token {other:?}"),
                ))
            }
        };
        let end = (offset + self.page_size).min(loaded.records.len());
        let items = loaded.records.get(offset..end).unwrap_or(&[]).to_vec();
        let next = (end < loaded.records.len()).then_some(PageToken::Offset(end));
        Ok(Page::new(items, next))
    }
}
