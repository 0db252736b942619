use std::path::{Path, PathBuf};

use async_trait::async_trait;
use footprint_adapters::{
    bundle_path, definition_for, Connector, ConnectorError, Page, PageToken, SourcePlugin,
    StreamSpec,
};
use footprint_core::{ParentLink, Since, SourceId, SourceRecord, YearMonth};
use footprint_sync::{AppConfig, DirectoryPublisher, Pipeline, SyncError};
use tempfile::tempdir;

fn fixture_path(rel: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(rel)
}

fn stage_export(config: &AppConfig, source: SourceId) {
    let target = bundle_path(&config.import_dir, source);
    std::fs::create_dir_all(target.parent().expect("parent")).expect("mkdir");
    std::fs::copy(fixture_path(&format!("{source}/export.json")), &target).expect("copy export");
}

fn period(value: &str) -> YearMonth {
    YearMonth::parse(value).expect("period")
}

#[tokio::test]
async fn bundle_sources_sync_analyze_and_publish() {
    let dir = tempdir().expect("tempdir");
    let config = AppConfig::rooted(dir.path());
    for source in [SourceId::Letterboxd, SourceId::Overcast, SourceId::Strong] {
        stage_export(&config, source);
    }
    let pipeline = Pipeline::new(config.clone());

    let outcomes = pipeline.sync_all(&SourceId::ALL).await;
    assert_eq!(outcomes.len(), SourceId::ALL.len());
    for outcome in &outcomes {
        match outcome.source {
            SourceId::Letterboxd | SourceId::Overcast | SourceId::Strong => {
                assert!(outcome.is_ok(), "{} failed: {:?}", outcome.source, outcome.result)
            }
            _ => assert!(
                matches!(outcome.result, Err(SyncError::Config { .. })),
                "{} should lack credentials",
                outcome.source
            ),
        }
    }
    let readwise = outcomes
        .iter()
        .find(|o| o.source == SourceId::Readwise)
        .expect("readwise outcome");
    let message = readwise.result.as_ref().expect_err("config").to_string();
    assert!(message.contains("READWISE_ACCESS_TOKEN"), "{message}");

    let overcast = outcomes
        .iter()
        .find(|o| o.source == SourceId::Overcast)
        .and_then(|o| o.result.as_ref().ok())
        .expect("overcast stats");
    assert_eq!(overcast.items_written, 4);
    assert_eq!(overcast.items_skipped, 1, "episode of an unknown feed");

    let strong = outcomes
        .iter()
        .find(|o| o.source == SourceId::Strong)
        .and_then(|o| o.result.as_ref().ok())
        .expect("strong stats");
    assert_eq!(strong.items_written, 6);
    assert_eq!(strong.parents_created, 0, "workouts precede their sets");

    let analyzed = pipeline
        .analyze_all(&[SourceId::Letterboxd, SourceId::Overcast, SourceId::Strong])
        .await;
    assert!(analyzed.iter().all(|o| o.is_ok()));

    let statuses = pipeline.status().await.expect("status");
    let letterboxd = statuses
        .iter()
        .find(|s| s.source == SourceId::Letterboxd)
        .expect("letterboxd status");
    assert!(letterboxd.initialized);
    assert_eq!(
        letterboxd.row_counts,
        vec![("films", 3), ("watches", 4), ("ratings", 2)]
    );
    assert_eq!(letterboxd.analysis.rows, 2);
    assert_eq!(letterboxd.analysis.latest, Some(period("2025-03")));
    assert_eq!(letterboxd.watermarks.len(), 1);
    assert!(letterboxd.watermarks[0].last_cursor.is_some());
    let github = statuses
        .iter()
        .find(|s| s.source == SourceId::Github)
        .expect("github status");
    assert!(!github.initialized, "status never creates databases");

    let markdown = pipeline
        .report_markdown()
        .await
        .expect("report")
        .expect("a month was analysed");
    assert!(markdown.contains("period: \"2025-03\""));
    assert!(markdown.contains("## Letterboxd"));
    assert!(markdown.contains("- movies watched: 3 (+200% MoM, N/A YoY)"), "{markdown}");
    assert!(markdown.contains("- avg rating: 3.75"), "{markdown}");

    let publisher = DirectoryPublisher::new(&config.publish_dir);
    let published = pipeline.publish(&publisher, false).await.expect("publish");
    assert!(published.checks.is_empty());
    assert_eq!(
        published.receipt.message,
        "Update digital footprint for 2025-03"
    );
    for rel in [
        "reports/2025-03.md",
        "data/activity/movies.yaml",
        "data/activity/podcasts.yaml",
        "data/activity/workouts.yaml",
        "manifest.json",
    ] {
        assert!(config.publish_dir.join(rel).exists(), "{rel} missing");
    }
    let movies: serde_yaml::Value = serde_yaml::from_str(
        &std::fs::read_to_string(config.publish_dir.join("data/activity/movies.yaml"))
            .expect("history"),
    )
    .expect("yaml");
    assert_eq!(movies[0]["year_month"], serde_yaml::Value::from("2025-02"));
    assert_eq!(movies[1]["movies_watched"], serde_yaml::Value::from(3));
}

#[tokio::test]
async fn resync_of_an_unchanged_export_is_a_no_op() {
    let dir = tempdir().expect("tempdir");
    let config = AppConfig::rooted(dir.path());
    stage_export(&config, SourceId::Letterboxd);
    let pipeline = Pipeline::new(config);

    let first = pipeline
        .sync_source(SourceId::Letterboxd)
        .await
        .expect("first sync");
    assert_eq!(first.items_written, 9);
    let second = pipeline
        .sync_source(SourceId::Letterboxd)
        .await
        .expect("second sync");
    assert_eq!(second.items_written, 0);

    let status = pipeline.status().await.expect("status");
    let letterboxd = status
        .iter()
        .find(|s| s.source == SourceId::Letterboxd)
        .expect("status");
    assert_eq!(
        letterboxd.row_counts,
        vec![("films", 3), ("watches", 4), ("ratings", 2)]
    );
}

#[tokio::test]
async fn dry_run_publish_checks_sources_and_writes_nothing() {
    let dir = tempdir().expect("tempdir");
    let config = AppConfig::rooted(dir.path());
    stage_export(&config, SourceId::Strong);
    let pipeline = Pipeline::new(config.clone());
    pipeline
        .sync_source(SourceId::Strong)
        .await
        .expect("sync");
    pipeline
        .analyze_source(SourceId::Strong)
        .await
        .expect("analyze");

    let publisher = DirectoryPublisher::new(&config.publish_dir);
    let outcome = pipeline.publish(&publisher, true).await.expect("dry run");
    assert!(outcome.receipt.dry_run);
    assert_eq!(outcome.checks.len(), SourceId::ALL.len());
    assert!(!outcome.all_checks_passed());
    let strong = outcome
        .checks
        .iter()
        .find(|c| c.source == SourceId::Strong)
        .expect("strong check");
    assert!(strong.is_ok());
    assert!(outcome
        .receipt
        .files
        .iter()
        .any(|f| f.path == "data/activity/workouts.yaml"));
    assert!(!config.publish_dir.exists());
}

/// Check-ins served from memory; places are looked up in `directory`.
struct ScriptedCheckins {
    records: Vec<SourceRecord>,
    directory: Vec<SourceRecord>,
    reject_credentials: bool,
}

impl ScriptedCheckins {
    fn new(records: Vec<SourceRecord>, directory: Vec<SourceRecord>) -> Self {
        Self {
            records,
            directory,
            reject_credentials: false,
        }
    }
}

#[async_trait]
impl Connector for ScriptedCheckins {
    fn source(&self) -> SourceId {
        SourceId::Foursquare
    }

    async fn validate_credentials(&self) -> Result<(), ConnectorError> {
        if self.reject_credentials {
            return Err(ConnectorError::Auth {
                source_id: SourceId::Foursquare,
                message: "invalid_auth".into(),
            });
        }
        Ok(())
    }

    async fn streams(&self) -> Result<Vec<StreamSpec>, ConnectorError> {
        Ok(vec![StreamSpec::new("checkins", "checkin")])
    }

    async fn fetch_page(
        &self,
        _stream: &StreamSpec,
        since: Option<&Since>,
        _page: Option<&PageToken>,
    ) -> Result<Page, ConnectorError> {
        let items = self
            .records
            .iter()
            .filter(|r| match since {
                Some(Since::After(at)) => r.observed_at.map_or(true, |seen| seen > *at),
                _ => true,
            })
            .cloned()
            .collect();
        Ok(Page::new(items, None))
    }

    async fn resolve_parent(&self, link: &ParentLink) -> Result<Option<SourceRecord>, ConnectorError> {
        Ok(self
            .directory
            .iter()
            .find(|p| link.key.as_deref() == Some(p.key.as_str()))
            .cloned())
    }
}

fn checkin(id: &str, place: Option<&str>, epoch: i64, embedded: Option<&str>) -> SourceRecord {
    let embedded = embedded.map(|name| {
        SourceRecord::new("place", "")
            .field("name", name)
            .fields
    });
    SourceRecord::new("checkin", id)
        .field("created_at", epoch)
        .field("type", "checkin")
        .observed_at(chrono::DateTime::from_timestamp(epoch, 0))
        .parent("place", place.map(str::to_string), embedded)
}

fn plugin(connector: ScriptedCheckins) -> SourcePlugin {
    SourcePlugin {
        definition: definition_for(SourceId::Foursquare),
        connector: Box::new(connector),
    }
}

#[tokio::test]
async fn parents_are_resolved_before_dependents_or_the_record_is_skipped() {
    let dir = tempdir().expect("tempdir");
    let pipeline = Pipeline::new(AppConfig::rooted(dir.path()));
    // 2025-03-04, 2025-03-09, 2025-03-15, 2025-03-20, 2025-03-31 (UTC)
    let records = vec![
        checkin("c1", Some("p1"), 1_741_100_000, Some("Corner Cafe")),
        checkin("c2", Some("p1"), 1_741_500_000, None),
        checkin("c3", Some("p2"), 1_742_000_000, None),
        checkin("c4", Some("p3"), 1_742_450_000, None),
        checkin("c5", None, 1_743_400_000, Some("Nameless")),
        SourceRecord::new("place", "p1")
            .field("name", "Corner Cafe")
            .field("locality", "Lisbon"),
    ];
    let directory = vec![SourceRecord::new("place", "p2").field("name", "Harbor Gym")];
    let connector = ScriptedCheckins::new(records, directory);

    let plugin = plugin(connector);
    let stats = pipeline.sync_plugin(&plugin).await.expect("sync");
    assert_eq!(stats.items_written, 4, "c1, c2, c3 and place p1");
    assert_eq!(stats.items_skipped, 2, "c4 has no findable place, c5 no place id");
    assert_eq!(stats.parents_created, 2, "p1 from the embedded venue, p2 from lookup");

    let status = pipeline.status().await.expect("status");
    let foursquare = status
        .iter()
        .find(|s| s.source == SourceId::Foursquare)
        .expect("status");
    assert_eq!(foursquare.row_counts, vec![("places", 2), ("checkins", 3)]);
    assert_eq!(
        foursquare.watermarks[0].last_sync_at,
        chrono::DateTime::from_timestamp(1_742_000_000, 0),
        "skipped records do not move the watermark"
    );

    pipeline
        .analyze_source(SourceId::Foursquare)
        .await
        .expect("analyze");
    let markdown = pipeline
        .report_markdown()
        .await
        .expect("report")
        .expect("month");
    assert!(markdown.contains("- checkins: 3"), "{markdown}");
    assert!(markdown.contains("- unique places: 2"), "{markdown}");
}

#[tokio::test]
async fn same_batch_twice_keeps_one_row_per_key() {
    let dir = tempdir().expect("tempdir");
    let pipeline = Pipeline::new(AppConfig::rooted(dir.path()));
    let batch = || {
        vec![
            checkin("c1", Some("p1"), 1_741_100_000, Some("Corner Cafe")),
            checkin("c2", Some("p1"), 1_741_500_000, Some("Corner Cafe")),
        ]
    };

    let first = plugin(ScriptedCheckins::new(batch(), Vec::new()));
    pipeline.sync_plugin(&first).await.expect("first");

    // Same records again, as a connector ignoring the watermark would send them.
    let mut replay = batch();
    for record in &mut replay {
        record.observed_at = None;
    }
    let second = plugin(ScriptedCheckins::new(replay, Vec::new()));
    let stats = pipeline.sync_plugin(&second).await.expect("second");
    assert_eq!(stats.items_written, 2);
    assert_eq!(stats.parents_created, 0);

    let status = pipeline.status().await.expect("status");
    let foursquare = status
        .iter()
        .find(|s| s.source == SourceId::Foursquare)
        .expect("status");
    assert_eq!(foursquare.row_counts, vec![("places", 1), ("checkins", 2)]);
    assert_eq!(
        foursquare.watermarks[0].last_sync_at,
        chrono::DateTime::from_timestamp(1_741_500_000, 0)
    );
}

#[tokio::test]
async fn rejected_credentials_stop_the_source_before_any_write() {
    let dir = tempdir().expect("tempdir");
    let pipeline = Pipeline::new(AppConfig::rooted(dir.path()));
    let mut connector = ScriptedCheckins::new(
        vec![checkin("c1", Some("p1"), 1_741_100_000, Some("Corner Cafe"))],
        Vec::new(),
    );
    connector.reject_credentials = true;

    let err = pipeline
        .sync_plugin(&plugin(connector))
        .await
        .expect_err("auth");
    assert!(matches!(err, SyncError::Auth { .. }));
    let status = pipeline.status().await.expect("status");
    assert!(status.iter().all(|s| !s.initialized));
}
