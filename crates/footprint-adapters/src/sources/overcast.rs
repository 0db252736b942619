//! Overcast podcast subscriptions and episode history from the OPML export.

use footprint_core::catalog::column;
use footprint_core::{
    ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, ParentDef, SourceDefinition,
    SourceId, SourceRecord,
};

use crate::bundle::{BundleConnector, ExportBundle};
use crate::json::{bool_at, i64_at, present, str_at};
use crate::ConnectorSettings;

const SOURCE: SourceId = SourceId::Overcast;

const FEED_COLUMNS: &[ColumnDef] = &[
    column("title", ColumnType::Text),
    column("overcast_id", ColumnType::Text),
    column("added_at", ColumnType::Text),
    column("removed_at", ColumnType::Text),
];

const EPISODE_COLUMNS: &[ColumnDef] = &[
    column("feed_url", ColumnType::Text),
    column("title", ColumnType::Text),
    column("overcast_url", ColumnType::Text),
    column("published_at", ColumnType::Text),
    column("user_updated_at", ColumnType::Text),
    column("played", ColumnType::Integer),
    column("progress", ColumnType::Integer),
    column("user_deleted", ColumnType::Integer),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[
        EntityDef {
            entity: "feed",
            table: "feeds",
            key_column: "xml_url",
            columns: FEED_COLUMNS,
            parent: None,
        },
        EntityDef {
            entity: "episode",
            table: "episodes",
            key_column: "episode_url",
            columns: EPISODE_COLUMNS,
            parent: Some(ParentDef {
                entity: "feed",
                column: "feed_url",
            }),
        },
    ],
    metric_queries: &[
        MetricQuery {
            name: "feeds_added",
            sql: "SELECT added_at AS bucket_ts FROM feeds WHERE added_at IS NOT NULL",
            metrics: &[MetricDef::count("feeds_added")],
        },
        MetricQuery {
            name: "feeds_removed",
            sql: "SELECT removed_at AS bucket_ts FROM feeds WHERE removed_at IS NOT NULL",
            metrics: &[MetricDef::count("feeds_removed")],
        },
        MetricQuery {
            name: "episodes_played",
            sql: "SELECT user_updated_at AS bucket_ts FROM episodes \
                  WHERE played = 1 AND user_updated_at IS NOT NULL",
            metrics: &[MetricDef::count("episodes_played")],
        },
    ],
    comparison_metrics: &["episodes_played"],
};

pub fn normalize(bundle: &ExportBundle) -> Vec<SourceRecord> {
    let feeds = bundle.rows("feeds").iter().filter_map(|row| {
        let xml_url = str_at(row, &["xmlUrl"])?;
        Some(
            SourceRecord::new("feed", xml_url)
                .field_opt("title", present(row, &["title"], str_at))
                .field_opt("overcast_id", present(row, &["overcastId"], str_at))
                .field_opt("added_at", present(row, &["overcastAddedDate"], str_at))
                .field_opt("removed_at", present(row, &["dateRemoveDetected"], str_at)),
        )
    });

    // Episodes name their feed only by URL; a feed missing from the export
    // leaves the episode without a resolvable parent.
    let episodes = bundle.rows("episodes").iter().filter_map(|row| {
        let url = str_at(row, &["enclosureUrl"]).or_else(|| str_at(row, &["url"]))?;
        Some(
            SourceRecord::new("episode", url)
                .field_opt("title", present(row, &["title"], str_at))
                .field_opt("overcast_url", present(row, &["overcastUrl"], str_at))
                .field_opt("published_at", present(row, &["pubDate"], str_at))
                .field_opt("user_updated_at", present(row, &["userUpdatedDate"], str_at))
                .field_opt("played", present(row, &["played"], bool_at))
                .field_opt("progress", present(row, &["progress"], i64_at))
                .field_opt("user_deleted", present(row, &["userDeleted"], bool_at))
                .parent(
                    "feed",
                    str_at(row, &["feedXmlUrl"]).map(str::to_string),
                    None,
                ),
        )
    });

    feeds.chain(episodes).collect()
}

pub fn connector(settings: &ConnectorSettings) -> BundleConnector {
    BundleConnector::new(SOURCE, settings, normalize)
}
