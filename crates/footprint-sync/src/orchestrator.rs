//! Watermark-driven incremental sync of one source into its store.

use footprint_adapters::{Connector, ConnectorError, Page, PageToken, StreamSpec};
use footprint_core::{ParentLink, SourceRecord, StreamOrder, StreamProgress, SyncStats, Watermark};
use footprint_storage::{SourceStore, StoreError, UnitOfWork};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Records written between intermediate commits.
    pub checkpoint_every: usize,
    /// Upper bound on pages fetched per stream in one run.
    pub max_pages: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkpoint_every: 100,
            max_pages: 10_000,
        }
    }
}

/// Why a single record was not written. None of these abort the stream
/// except `Fatal`.
#[derive(Debug)]
enum RecordError {
    UnresolvedParent { entity: &'static str },
    Store(StoreError),
    Fatal(ConnectorError),
}

impl From<StoreError> for RecordError {
    fn from(err: StoreError) -> Self {
        RecordError::Store(err)
    }
}

enum ParentState {
    Present,
    Created,
    Unresolved,
}

#[derive(Debug, Clone, Default)]
pub struct SyncOrchestrator {
    options: SyncOptions,
}

impl SyncOrchestrator {
    pub fn new(options: SyncOptions) -> Self {
        Self {
            options: SyncOptions {
                checkpoint_every: options.checkpoint_every.max(1),
                max_pages: options.max_pages.max(1),
            },
        }
    }

    /// Pulls every stream of `connector` newer than its watermark into
    /// `store`. Authentication and configuration failures abort the source;
    /// transient upstream failures end the affected stream early.
    pub async fn sync(
        &self,
        store: &SourceStore,
        connector: &dyn Connector,
    ) -> Result<SyncStats, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync", %run_id, source = %store.source());
        async move {
            let mut stats = SyncStats::default();
            let streams = match connector.streams().await {
                Ok(streams) => streams,
                Err(ConnectorError::Transient { message, .. }) => {
                    warn!(%message, "could not list streams; nothing synced this run");
                    stats.interrupted = true;
                    return Ok(stats);
                }
                Err(err) => return Err(err.into()),
            };

            for stream in &streams {
                let stream_stats = self
                    .sync_stream(store, connector, stream)
                    .instrument(info_span!("stream", stream = %stream.name))
                    .await?;
                stats.merge(stream_stats);
            }
            info!(
                written = stats.items_written,
                skipped = stats.items_skipped,
                parents = stats.parents_created,
                interrupted = stats.interrupted,
                "sync finished"
            );
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    async fn sync_stream(
        &self,
        store: &SourceStore,
        connector: &dyn Connector,
        stream: &StreamSpec,
    ) -> Result<SyncStats, SyncError> {
        let mut unit = store.begin().await?;
        let mut committed = unit.watermark(&stream.name).await?;
        let since = committed.since(stream.bound);
        debug!(?since, "starting stream");

        let mut stats = SyncStats::default();
        let mut progress = StreamProgress::default();
        let mut pending = 0usize;
        let mut token: Option<PageToken> = None;
        let mut visited: Vec<PageToken> = Vec::new();
        let mut pages = 0usize;
        let mut complete = true;

        loop {
            if pages == self.options.max_pages {
                warn!(pages, "page limit reached; remaining pages wait for the next run");
                complete = false;
                break;
            }
            pages += 1;

            let page = match connector
                .fetch_page(stream, since.as_ref(), token.as_ref())
                .await
            {
                Ok(page) => page,
                Err(ConnectorError::Transient { message, .. }) => {
                    warn!(%message, "upstream unavailable; stopping stream");
                    stats.interrupted = true;
                    complete = false;
                    break;
                }
                // Dropping `unit` rolls back everything since the last checkpoint.
                Err(err) => return Err(err.into()),
            };

            for record in &page.items {
                match self.write_record(&mut unit, connector, record).await {
                    Ok(created) => {
                        stats.items_written += 1;
                        stats.parents_created += created;
                        progress.observe(record);
                        pending += 1;
                    }
                    Err(RecordError::Fatal(err)) => return Err(err.into()),
                    Err(RecordError::UnresolvedParent { entity }) => {
                        warn!(key = %record.key, entity = record.entity, parent = entity, "skipping record: parent could not be resolved");
                        stats.items_skipped += 1;
                    }
                    Err(RecordError::Store(err)) => {
                        warn!(key = %record.key, entity = record.entity, error = %err, "skipping record: write failed");
                        stats.items_skipped += 1;
                    }
                }

                if pending >= self.options.checkpoint_every {
                    if stream.order == StreamOrder::Ascending {
                        committed = persist_watermark(&mut unit, committed, &progress).await?;
                    }
                    unit.commit().await?;
                    debug!(written = stats.items_written, "checkpoint committed");
                    unit = store.begin().await?;
                    pending = 0;
                }
            }

            if is_last_page(stream, &page, &visited) {
                break;
            }
            if let Some(next) = &page.next {
                visited.push(next.clone());
            }
            token = page.next;
        }

        // A descending stream cut short has gaps below its newest record.
        if complete || stream.order == StreamOrder::Ascending {
            persist_watermark(&mut unit, committed, &progress).await?;
        }
        unit.commit().await?;
        info!(
            written = stats.items_written,
            skipped = stats.items_skipped,
            pages,
            "stream synced"
        );
        Ok(stats)
    }

    /// Writes `record` and, first, its missing parent inside one savepoint.
    /// Returns how many parents were created.
    async fn write_record(
        &self,
        unit: &mut UnitOfWork<'static>,
        connector: &dyn Connector,
        record: &SourceRecord,
    ) -> Result<usize, RecordError> {
        let mut savepoint = unit.nested().await?;
        let mut created = 0;
        if let Some(link) = &record.parent {
            match ensure_parent(&mut savepoint, connector, link).await? {
                ParentState::Present => {}
                ParentState::Created => created = 1,
                ParentState::Unresolved => {
                    return Err(RecordError::UnresolvedParent {
                        entity: link.entity,
                    })
                }
            }
        }
        savepoint.upsert(record).await?;
        savepoint.commit().await?;
        Ok(created)
    }
}

/// Makes sure the parent named by `link` is stored: already present, looked
/// up through the connector, or built from the attributes embedded in the
/// dependent record, in that order.
async fn ensure_parent(
    unit: &mut UnitOfWork<'_>,
    connector: &dyn Connector,
    link: &ParentLink,
) -> Result<ParentState, RecordError> {
    let Some(key) = link.key.as_deref() else {
        return Ok(ParentState::Unresolved);
    };
    if unit.record_exists(link.entity, key).await? {
        return Ok(ParentState::Present);
    }

    let resolved = match connector.resolve_parent(link).await {
        Ok(parent) => parent,
        Err(err @ (ConnectorError::Auth { .. } | ConnectorError::Config { .. })) => {
            return Err(RecordError::Fatal(err))
        }
        Err(err) => {
            debug!(parent = key, error = %err, "parent lookup failed");
            None
        }
    };
    let parent = resolved.or_else(|| {
        link.embedded.as_ref().map(|fields| SourceRecord {
            fields: fields.clone(),
            ..SourceRecord::new(link.entity, key)
        })
    });

    match parent {
        Some(parent) => {
            unit.upsert(&parent).await?;
            debug!(entity = parent.entity, key = %parent.key, "created parent");
            Ok(ParentState::Created)
        }
        None => Ok(ParentState::Unresolved),
    }
}

/// Writes the watermark advanced by `progress` when it moves forward and
/// returns the value now stored.
async fn persist_watermark(
    unit: &mut UnitOfWork<'static>,
    committed: Watermark,
    progress: &StreamProgress,
) -> Result<Watermark, StoreError> {
    match committed.advanced_by(progress) {
        Some(next) => {
            unit.put_watermark(&next).await?;
            debug!(last_sync_at = ?next.last_sync_at, last_cursor = ?next.last_cursor, "watermark advanced");
            Ok(next)
        }
        None => Ok(committed),
    }
}

fn is_last_page(stream: &StreamSpec, page: &Page, visited: &[PageToken]) -> bool {
    let Some(next) = &page.next else {
        return true;
    };
    if page.upstream_count == 0 {
        return true;
    }
    if stream.page_size.is_some_and(|size| page.upstream_count < size) {
        return true;
    }
    if visited.contains(next) {
        warn!(?next, "page token repeated; stopping");
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use footprint_adapters::definition_for;
    use footprint_core::{Since, SourceId};
    use footprint_storage::Initializable;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0)
            .single()
            .expect("timestamp")
    }

    fn commit(sha: &str, day: u32) -> SourceRecord {
        SourceRecord::new("commit", sha)
            .field("repo", "octo/footprint")
            .field("author_date", format!("2025-03-{day:02}T10:00:00Z"))
            .observed_at(Some(at(day, 10)))
    }

    enum Step {
        Serve(Page),
        Unavailable,
        Revoked,
    }

    /// Serves scripted pages and records the bounds it was asked for.
    struct PagedConnector {
        stream: StreamSpec,
        steps: Vec<Step>,
        calls: Mutex<Vec<(Option<Since>, Option<PageToken>)>>,
    }

    impl PagedConnector {
        fn new(stream: StreamSpec, steps: Vec<Step>) -> Self {
            Self {
                stream,
                steps,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Option<Since>, Option<PageToken>)> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Connector for PagedConnector {
        fn source(&self) -> SourceId {
            SourceId::Github
        }

        async fn validate_credentials(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
            Ok(vec![self.stream.clone()])
        }

        async fn fetch_page(
            &self,
            _stream: &StreamSpec,
            since: Option<&Since>,
            page: Option<&PageToken>,
        ) -> Result<Page, ConnectorError> {
            self.calls
                .lock()
                .expect("lock")
                .push((since.cloned(), page.cloned()));
            let index = match page {
                Some(PageToken::Offset(i)) => *i,
                _ => 0,
            };
            match self.steps.get(index) {
                Some(Step::Serve(page)) => Ok(page.clone()),
                Some(Step::Unavailable) => Err(ConnectorError::Transient {
                    source_id: SourceId::Github,
                    message: "503 after retries".into(),
                }),
                Some(Step::Revoked) => Err(ConnectorError::Auth {
                    source_id: SourceId::Github,
                    message: "token revoked".into(),
                }),
                None => Ok(Page::default()),
            }
        }
    }

    async fn open_store(dir: &std::path::Path) -> SourceStore {
        let store = SourceStore::open(definition_for(SourceId::Github), dir)
            .await
            .expect("open");
        store.init_tables().await.expect("init");
        store
    }

    fn stream() -> StreamSpec {
        StreamSpec::new("commits:octo/footprint", "commit").page_size(2)
    }

    #[tokio::test]
    async fn pages_until_a_short_page_and_advances_the_watermark() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let connector = PagedConnector::new(
            stream(),
            vec![
                Step::Serve(Page::new(vec![commit("c3", 3), commit("c2", 2)], Some(PageToken::Offset(1)))),
                Step::Serve(Page::new(vec![commit("c1", 1)], Some(PageToken::Offset(2)))),
                Step::Serve(Page::new(vec![commit("never", 9)], None)),
            ],
        );

        let stats = SyncOrchestrator::default()
            .sync(&store, &connector)
            .await
            .expect("sync");
        assert_eq!(stats.items_written, 3);
        assert!(!stats.interrupted);
        assert_eq!(connector.calls().len(), 2, "short page ends pagination");

        let watermarks = store.watermarks().await.expect("watermarks");
        assert_eq!(watermarks.len(), 1);
        assert_eq!(watermarks[0].last_sync_at, Some(at(3, 10)));
    }

    #[tokio::test]
    async fn next_run_starts_from_the_stored_watermark() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let first = PagedConnector::new(
            stream(),
            vec![Step::Serve(Page::new(vec![commit("c2", 2)], None))],
        );
        SyncOrchestrator::default()
            .sync(&store, &first)
            .await
            .expect("first sync");

        let second = PagedConnector::new(stream().inclusive(), vec![Step::Serve(Page::default())]);
        SyncOrchestrator::default()
            .sync(&store, &second)
            .await
            .expect("second sync");
        let calls = second.calls();
        assert_eq!(
            calls[0].0,
            Some(Since::After(at(2, 10) + chrono::Duration::seconds(1))),
            "inclusive upstreams get the bound bumped"
        );
    }

    #[tokio::test]
    async fn repeated_tokens_do_not_loop() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let looping = Page::new(vec![commit("c1", 1), commit("c2", 2)], Some(PageToken::Offset(1)));
        let connector = PagedConnector::new(
            stream(),
            vec![Step::Serve(looping.clone()), Step::Serve(looping)],
        );

        let stats = SyncOrchestrator::default()
            .sync(&store, &connector)
            .await
            .expect("sync");
        assert_eq!(connector.calls().len(), 2);
        assert_eq!(stats.items_written, 4, "rewrites are idempotent upserts");
        assert_eq!(
            store.row_counts().await.expect("counts"),
            vec![("commits", 2)]
        );
    }

    #[tokio::test]
    async fn transient_failure_keeps_descending_watermark() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let connector = PagedConnector::new(
            stream(),
            vec![
                Step::Serve(Page::new(vec![commit("c5", 5), commit("c4", 4)], Some(PageToken::Offset(1)))),
                Step::Unavailable,
            ],
        );

        let stats = SyncOrchestrator::default()
            .sync(&store, &connector)
            .await
            .expect("transient failures are not fatal");
        assert!(stats.interrupted);
        assert_eq!(stats.items_written, 2);
        assert_eq!(store.row_counts().await.expect("counts"), vec![("commits", 2)]);
        assert!(store.watermarks().await.expect("watermarks").is_empty());
    }

    #[tokio::test]
    async fn transient_failure_advances_ascending_watermark() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let connector = PagedConnector::new(
            stream().ascending(),
            vec![
                Step::Serve(Page::new(vec![commit("c1", 1), commit("c2", 2)], Some(PageToken::Offset(1)))),
                Step::Unavailable,
            ],
        );

        let stats = SyncOrchestrator::default()
            .sync(&store, &connector)
            .await
            .expect("sync");
        assert!(stats.interrupted);
        let watermarks = store.watermarks().await.expect("watermarks");
        assert_eq!(watermarks[0].last_sync_at, Some(at(2, 10)));
    }

    #[tokio::test]
    async fn auth_failure_rolls_back_the_open_unit() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let connector = PagedConnector::new(
            stream(),
            vec![
                Step::Serve(Page::new(vec![commit("c5", 5), commit("c4", 4)], Some(PageToken::Offset(1)))),
                Step::Revoked,
            ],
        );

        let err = SyncOrchestrator::default()
            .sync(&store, &connector)
            .await
            .expect_err("auth is fatal");
        assert!(err.is_fatal());
        assert_eq!(store.row_counts().await.expect("counts"), vec![("commits", 0)]);
    }

    #[tokio::test]
    async fn checkpoints_survive_a_later_fatal_error() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let connector = PagedConnector::new(
            stream(),
            vec![
                Step::Serve(Page::new(vec![commit("c5", 5), commit("c4", 4)], Some(PageToken::Offset(1)))),
                Step::Revoked,
            ],
        );

        SyncOrchestrator::new(SyncOptions {
            checkpoint_every: 2,
            max_pages: 10,
        })
        .sync(&store, &connector)
        .await
        .expect_err("auth is fatal");
        assert_eq!(store.row_counts().await.expect("counts"), vec![("commits", 2)]);
        assert!(
            store.watermarks().await.expect("watermarks").is_empty(),
            "descending streams only advance after the whole batch"
        );
    }

    #[tokio::test]
    async fn max_pages_bounds_a_stream() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(dir.path()).await;
        let pages = (0..5)
            .map(|i| {
                Step::Serve(Page::new(
                    vec![commit(&format!("c{i}a"), 1), commit(&format!("c{i}b"), 2)],
                    Some(PageToken::Offset(i + 1)),
                ))
            })
            .collect();
        let connector = PagedConnector::new(stream(), pages);

        SyncOrchestrator::new(SyncOptions {
            checkpoint_every: 100,
            max_pages: 3,
        })
        .sync(&store, &connector)
        .await
        .expect("sync");
        assert_eq!(connector.calls().len(), 3);
        assert!(
            store.watermarks().await.expect("watermarks").is_empty(),
            "unfinished descending stream keeps its watermark"
        );
    }

    #[test]
    fn short_and_empty_pages_end_pagination() {
        let spec = stream();
        let token = Some(PageToken::Offset(1));
        let full = Page::new(vec![commit("a", 1), commit("b", 1)], token.clone());
        assert!(!is_last_page(&spec, &full, &[]));
        assert!(is_last_page(&spec, &Page::new(vec![commit("a", 1)], token.clone()), &[]));
        assert!(is_last_page(&spec, &Page::new(Vec::new(), token.clone()), &[]));
        assert!(is_last_page(&spec, &Page::new(vec![commit("a", 1)], None), &[]));
        assert!(is_last_page(&spec, &full, &[PageToken::Offset(1)]));

        let unsized_stream = StreamSpec::new("x", "commit");
        let upstream_filtered = Page::new(Vec::new(), token).with_upstream_count(50);
        assert!(!is_last_page(&unsized_stream, &upstream_filtered, &[]));
    }
}
