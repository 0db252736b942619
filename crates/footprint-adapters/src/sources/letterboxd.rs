//! Letterboxd watch history and ratings from the account export.

use std::collections::BTreeMap;

use footprint_core::catalog::column;
use footprint_core::{
    Aggregate, ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, ParentDef,
    SourceDefinition, SourceId, SourceRecord,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::bundle::{BundleConnector, ExportBundle};
use crate::json::{composite_key, f64_at, i64_at, present, str_at};
use crate::ConnectorSettings;

const SOURCE: SourceId = SourceId::Letterboxd;

const FILM_COLUMNS: &[ColumnDef] = &[
    column("name", ColumnType::Text),
    column("year", ColumnType::Integer),
];

const WATCH_COLUMNS: &[ColumnDef] = &[
    column("film_uri", ColumnType::Text),
    column("watched_at", ColumnType::Text),
];

const RATING_COLUMNS: &[ColumnDef] = &[
    column("film_uri", ColumnType::Text),
    column("rating", ColumnType::Real),
    column("rated_at", ColumnType::Text),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[
        EntityDef {
            entity: "film",
            table: "films",
            key_column: "letterboxd_uri",
            columns: FILM_COLUMNS,
            parent: None,
        },
        EntityDef {
            entity: "watch",
            table: "watches",
            key_column: "watch_id",
            columns: WATCH_COLUMNS,
            parent: Some(ParentDef {
                entity: "film",
                column: "film_uri",
            }),
        },
        EntityDef {
            entity: "rating",
            table: "ratings",
            key_column: "letterboxd_uri",
            columns: RATING_COLUMNS,
            parent: Some(ParentDef {
                entity: "film",
                column: "film_uri",
            }),
        },
    ],
    metric_queries: &[MetricQuery {
        name: "watches",
        // Age of a film is measured at the time it was watched.
        sql: "SELECT w.watched_at AS bucket_ts, r.rating AS rating, \
              CAST(substr(w.watched_at, 1, 4) AS INTEGER) - f.year AS years_since_release \
              FROM watches w \
              JOIN films f ON f.letterboxd_uri = w.film_uri \
              LEFT JOIN ratings r ON r.film_uri = w.film_uri \
              WHERE w.watched_at IS NOT NULL",
        metrics: &[
            MetricDef::count("movies_watched"),
            MetricDef::stat("avg_rating", Aggregate::Average, "rating").or_zero(),
            MetricDef::stat("min_rating", Aggregate::Min, "rating").or_zero(),
            MetricDef::stat("max_rating", Aggregate::Max, "rating").or_zero(),
            MetricDef::stat(
                "avg_years_since_release",
                Aggregate::Average,
                "years_since_release",
            )
            .or_zero(),
        ],
    }],
    comparison_metrics: &["movies_watched", "avg_rating"],
};

fn film_fields(row: &JsonValue) -> BTreeMap<String, JsonValue> {
    SourceRecord::new("film", "")
        .field_opt("name", present(row, &["Name"], str_at))
        .field_opt("year", present(row, &["Year"], i64_at))
        .fields
}

/// Films first (one per URI), then watches and ratings referencing them.
pub fn normalize(bundle: &ExportBundle) -> Vec<SourceRecord> {
    let mut films: BTreeMap<String, SourceRecord> = BTreeMap::new();
    let mut dependents = Vec::new();

    for row in bundle.rows("watched") {
        let (Some(uri), Some(date)) = (str_at(row, &["Letterboxd URI"]), str_at(row, &["Date"])) else {
            debug!(?row, "watched row without uri or date");
            continue;
        };
        let fields = film_fields(row);
        films.entry(uri.to_string()).or_insert_with(|| SourceRecord {
            fields: fields.clone(),
            ..SourceRecord::new("film", uri)
        });
        dependents.push(
            SourceRecord::new("watch", composite_key(&[uri, date]))
                .field("watched_at", date)
                .parent("film", Some(uri.to_string()), Some(fields)),
        );
    }

    for row in bundle.rows("ratings") {
        let Some(uri) = str_at(row, &["Letterboxd URI"]) else {
            continue;
        };
        let Some(rating) = f64_at(row, &["Rating"]).filter(|r| (0.5..=5.0).contains(r)) else {
            debug!(uri, "rating outside 0.5..=5.0");
            continue;
        };
        let fields = film_fields(row);
        films.entry(uri.to_string()).or_insert_with(|| SourceRecord {
            fields: fields.clone(),
            ..SourceRecord::new("film", uri)
        });
        dependents.push(
            SourceRecord::new("rating", uri)
                .field("rating", rating)
                .field_opt("rated_at", present(row, &["Date"], str_at))
                .parent("film", Some(uri.to_string()), Some(fields)),
        );
    }

    films.into_values().chain(dependents).collect()
}

pub fn connector(settings: &ConnectorSettings) -> BundleConnector {
    BundleConnector::new(SOURCE, settings, normalize)
}
