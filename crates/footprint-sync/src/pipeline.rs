//! Multi-source runs. Every source gets its own store and its own result;
//! one source failing never stops the others.

use anyhow::{Context, Result};
use chrono::Utc;
use footprint_adapters::{definition_for, source_plugin, ConnectorError, SourcePlugin};
use footprint_core::{SourceDefinition, SourceId, SyncStats, Watermark};
use footprint_storage::{AnalysisSummary, ExistenceCheck, Initializable, SourceStore, StoreError};
use tracing::{error, info, warn};

use crate::aggregate::AggregationEngine;
use crate::config::AppConfig;
use crate::orchestrator::SyncOrchestrator;
use crate::publish::{PublishReceipt, Publisher};
use crate::report::{ReportBundle, ReportGenerator};
use crate::SyncError;

/// Result of one source within a multi-source run.
#[derive(Debug)]
pub struct SourceOutcome<T> {
    pub source: SourceId,
    pub result: Result<T, SyncError>,
}

impl<T> SourceOutcome<T> {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceStatus {
    pub source: SourceId,
    /// The database exists and holds every table.
    pub initialized: bool,
    pub row_counts: Vec<(&'static str, i64)>,
    /// Streams without a row have never been synced.
    pub watermarks: Vec<Watermark>,
    pub analysis: AnalysisSummary,
}

#[derive(Debug)]
pub struct PublishOutcome {
    /// Credential checks; only run for dry runs.
    pub checks: Vec<SourceOutcome<()>>,
    pub bundle: ReportBundle,
    pub receipt: PublishReceipt,
}

impl PublishOutcome {
    pub fn all_checks_passed(&self) -> bool {
        self.checks.iter().all(SourceOutcome::is_ok)
    }
}

pub struct Pipeline {
    config: AppConfig,
    orchestrator: SyncOrchestrator,
    aggregation: AggregationEngine,
    reports: ReportGenerator,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let orchestrator = SyncOrchestrator::new(config.sync_options());
        Self {
            config,
            orchestrator,
            aggregation: AggregationEngine,
            reports: ReportGenerator,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Opens the store for `definition`, creating its tables if needed.
    pub async fn open_store(
        &self,
        definition: &'static SourceDefinition,
    ) -> Result<SourceStore, StoreError> {
        let store = SourceStore::open(definition, &self.config.data_dir).await?;
        store.init_tables().await?;
        Ok(store)
    }

    /// Stores that already exist with a complete schema. Never creates
    /// database files.
    async fn existing_stores(&self) -> Result<Vec<SourceStore>, StoreError> {
        let mut stores = Vec::new();
        for source in SourceId::ALL {
            if !SourceStore::database_path(&self.config.data_dir, source).exists() {
                continue;
            }
            let store = SourceStore::open(definition_for(source), &self.config.data_dir).await?;
            if store.tables_exist().await? {
                stores.push(store);
            } else {
                store.close().await;
            }
        }
        Ok(stores)
    }

    pub async fn init(&self, sources: &[SourceId]) -> Vec<SourceOutcome<()>> {
        let mut outcomes = Vec::with_capacity(sources.len());
        for &source in sources {
            let result = match self.open_store(definition_for(source)).await {
                Ok(store) => {
                    info!(%source, path = %store.path().display(), "tables ready");
                    store.close().await;
                    Ok(())
                }
                Err(err) => Err(SyncError::from(err)),
            };
            outcomes.push(SourceOutcome { source, result });
        }
        outcomes
    }

    /// Validates the plugin's credentials, then syncs it into its store.
    pub async fn sync_plugin(&self, plugin: &SourcePlugin) -> Result<SyncStats, SyncError> {
        match plugin.connector.validate_credentials().await {
            Ok(()) => {}
            Err(ConnectorError::Transient { message, .. }) => {
                warn!(source = %plugin.definition.source, %message, "upstream unavailable; skipping this run");
                return Ok(SyncStats {
                    interrupted: true,
                    ..SyncStats::default()
                });
            }
            Err(err) => return Err(err.into()),
        }

        let store = self.open_store(plugin.definition).await?;
        let result = self.orchestrator.sync(&store, plugin.connector.as_ref()).await;
        store.close().await;
        result
    }

    pub async fn sync_source(&self, source: SourceId) -> Result<SyncStats, SyncError> {
        let plugin = source_plugin(source, &self.config.connector_settings())?;
        self.sync_plugin(&plugin).await
    }

    pub async fn sync_all(&self, sources: &[SourceId]) -> Vec<SourceOutcome<SyncStats>> {
        let mut outcomes = Vec::with_capacity(sources.len());
        for &source in sources {
            let result = self.sync_source(source).await;
            if let Err(err) = &result {
                error!(%source, error = %err, "sync failed");
            }
            outcomes.push(SourceOutcome { source, result });
        }
        outcomes
    }

    pub async fn analyze_source(&self, source: SourceId) -> Result<usize, SyncError> {
        let store = self.open_store(definition_for(source)).await?;
        let result = self.aggregation.analyze(&store).await;
        store.close().await;
        Ok(result?)
    }

    pub async fn analyze_all(&self, sources: &[SourceId]) -> Vec<SourceOutcome<usize>> {
        let mut outcomes = Vec::with_capacity(sources.len());
        for &source in sources {
            let result = self.analyze_source(source).await;
            if let Err(err) = &result {
                error!(%source, error = %err, "analysis failed");
            }
            outcomes.push(SourceOutcome { source, result });
        }
        outcomes
    }

    pub async fn status(&self) -> Result<Vec<SourceStatus>, StoreError> {
        let mut statuses = Vec::with_capacity(SourceId::ALL.len());
        for source in SourceId::ALL {
            let mut status = SourceStatus {
                source,
                initialized: false,
                row_counts: Vec::new(),
                watermarks: Vec::new(),
                analysis: AnalysisSummary::default(),
            };
            if SourceStore::database_path(&self.config.data_dir, source).exists() {
                let store = SourceStore::open(definition_for(source), &self.config.data_dir).await?;
                if store.tables_exist().await? {
                    status.initialized = true;
                    status.row_counts = store.row_counts().await?;
                    status.watermarks = store.watermarks().await?;
                    status.analysis = store.analysis_summary().await?;
                }
                store.close().await;
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Renders the monthly report and history files from whatever has been
    /// analysed so far.
    pub async fn render(&self) -> Result<ReportBundle> {
        let stores = self
            .existing_stores()
            .await
            .context("opening source stores")?;
        let bundle = self.reports.artifacts(&stores, Utc::now()).await;
        for store in stores {
            store.close().await;
        }
        bundle
    }

    /// Markdown of the latest monthly report, if any month has been analysed.
    pub async fn report_markdown(&self) -> Result<Option<String>> {
        let stores = self
            .existing_stores()
            .await
            .context("opening source stores")?;
        let report = self.reports.build(&stores, Utc::now()).await;
        for store in stores {
            store.close().await;
        }
        report?.map(|r| r.render_markdown()).transpose()
    }

    async fn check_sources(&self) -> Vec<SourceOutcome<()>> {
        let settings = self.config.connector_settings();
        let mut checks = Vec::with_capacity(SourceId::ALL.len());
        for source in SourceId::ALL {
            let result = match source_plugin(source, &settings) {
                Ok(plugin) => plugin
                    .connector
                    .validate_credentials()
                    .await
                    .map_err(SyncError::from),
                Err(err) => Err(err.into()),
            };
            checks.push(SourceOutcome { source, result });
        }
        checks
    }

    /// Renders and publishes. A dry run checks every source's configuration
    /// and credentials instead of writing anything.
    pub async fn publish(&self, publisher: &dyn Publisher, dry_run: bool) -> Result<PublishOutcome> {
        let checks = if dry_run {
            self.check_sources().await
        } else {
            Vec::new()
        };
        let bundle = self.render().await?;
        let message = bundle.commit_message();
        let receipt = if dry_run {
            PublishReceipt::preview(&bundle.artifacts, &message)
        } else {
            publisher.publish(&bundle.artifacts, &message).await?
        };
        Ok(PublishOutcome {
            checks,
            bundle,
            receipt,
        })
    }
}
