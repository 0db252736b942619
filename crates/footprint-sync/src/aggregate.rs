//! Monthly rollups of a source's raw tables into its `analysis` table.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use footprint_core::{Aggregate, ColumnType, EmptyValue, MetricDef, YearMonth};
use footprint_storage::{format_timestamp, AnalysisRow, Cell, MetricRow, SourceStore, StoreError};
use tracing::{debug, info, info_span, Instrument};

/// Month bucket of a stored timestamp. Text keeps its own representation;
/// integers are unix epoch seconds.
pub fn bucket_of(cell: &Cell) -> Option<YearMonth> {
    match cell {
        Cell::Text(value) => YearMonth::from_stored(value),
        Cell::Integer(seconds) => YearMonth::from_epoch_seconds(*seconds),
        Cell::Real(seconds) => YearMonth::from_epoch_seconds(seconds.trunc() as i64),
        Cell::Null => None,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

fn distinct_key(cell: &Cell) -> Option<String> {
    match cell {
        Cell::Null => None,
        Cell::Text(v) => Some(v.clone()),
        Cell::Integer(v) => Some(v.to_string()),
        Cell::Real(v) => Some(v.to_string()),
    }
}

/// Value stored for `metric` in a month none of its rows reached.
pub fn empty_value(metric: &MetricDef) -> Option<f64> {
    match (metric.aggregate, metric.empty) {
        (Aggregate::Count | Aggregate::CountDistinct | Aggregate::Sum, _) => Some(0.0),
        (_, EmptyValue::Zero) => Some(0.0),
        (_, EmptyValue::Null) => None,
    }
}

/// Computes one metric over the rows of one bucket. Rows whose input is
/// NULL or not numeric still count as rows but take no part in numeric
/// aggregates.
pub fn compute_metric(metric: &MetricDef, rows: &[&MetricRow]) -> Option<f64> {
    let cells = || {
        rows.iter()
            .filter_map(|row| metric.input.and_then(|input| row.values.get(input)))
    };
    let numbers = || cells().filter_map(Cell::as_f64);

    let value = match metric.aggregate {
        Aggregate::Count => Some(rows.len() as f64),
        Aggregate::CountDistinct => {
            let distinct: BTreeSet<String> = cells().filter_map(distinct_key).collect();
            Some(distinct.len() as f64)
        }
        Aggregate::Sum => Some(numbers().sum()),
        Aggregate::Average => {
            let values: Vec<f64> = numbers().collect();
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        }
        Aggregate::Min => numbers().reduce(f64::min),
        Aggregate::Max => numbers().reduce(f64::max),
        Aggregate::Median => median(numbers().collect()),
    };

    let value = value.filter(|v| v.is_finite()).map(|v| match metric.ty {
        ColumnType::Integer => v.round(),
        _ => round_to(v, 2),
    });
    value.or_else(|| match metric.empty {
        EmptyValue::Zero => Some(0.0),
        EmptyValue::Null => None,
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationEngine;

impl AggregationEngine {
    pub async fn analyze(&self, store: &SourceStore) -> Result<usize, StoreError> {
        self.analyze_at(store, Utc::now()).await
    }

    /// Recomputes every month the source has data for and upserts one
    /// analysis row per month, stamped `now`. Returns the number of months
    /// written.
    pub async fn analyze_at(
        &self,
        store: &SourceStore,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let definition = store.definition();
        let span = info_span!("analyze", source = %definition.source);
        async move {
            let mut unit = store.begin().await?;
            let mut months: BTreeMap<YearMonth, BTreeMap<String, Option<f64>>> = BTreeMap::new();

            for query in definition.metric_queries {
                let rows = unit.metric_rows(query).await?;
                let mut buckets: BTreeMap<YearMonth, Vec<&MetricRow>> = BTreeMap::new();
                let mut unbucketed = 0usize;
                for row in &rows {
                    match bucket_of(&row.bucket) {
                        Some(period) => buckets.entry(period).or_default().push(row),
                        None => unbucketed += 1,
                    }
                }
                if unbucketed > 0 {
                    debug!(query = query.name, unbucketed, "rows without a usable timestamp");
                }

                for (period, rows) in &buckets {
                    let metrics = months.entry(*period).or_default();
                    for metric in query.metrics {
                        metrics.insert(metric.column.to_string(), compute_metric(metric, rows));
                    }
                }
            }

            let updated_at = format_timestamp(now);
            let written = months.len();
            for (period, mut metrics) in months {
                // Months reached by only some queries still get every column.
                for metric in definition.analysis_metrics() {
                    metrics
                        .entry(metric.column.to_string())
                        .or_insert_with(|| empty_value(metric));
                }
                unit.upsert_analysis(&AnalysisRow {
                    period,
                    metrics,
                    updated_at: updated_at.clone(),
                })
                .await?;
            }
            unit.commit().await?;
            info!(months = written, "analysis written");
            Ok(written)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use footprint_adapters::definition_for;
    use footprint_core::{SourceId, SourceRecord};
    use footprint_storage::Initializable;
    use tempfile::tempdir;

    fn row(bucket: Cell, values: &[(&str, Cell)]) -> MetricRow {
        MetricRow {
            bucket,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn month_boundaries_bucket_by_stored_text() {
        let first = bucket_of(&Cell::Text("2025-03-01T00:00:00".into()));
        let last = bucket_of(&Cell::Text("2025-03-31T23:59:59".into()));
        let next = bucket_of(&Cell::Text("2025-04-01T00:00:00".into()));
        assert_eq!(first, last);
        assert_ne!(last, next);
        // 2025-03-31T23:59:59Z and 2025-04-01T00:00:00Z
        assert_eq!(bucket_of(&Cell::Integer(1_743_465_599)), first);
        assert_eq!(bucket_of(&Cell::Integer(1_743_465_600)), next);
        assert_eq!(bucket_of(&Cell::Text("last tuesday".into())), None);
        assert_eq!(bucket_of(&Cell::Text("2025".into())), None, "a bare year is not 1970");
        assert_eq!(bucket_of(&Cell::Null), None);
    }

    #[test]
    fn averages_skip_nulls_but_counts_do_not() {
        let rows = vec![
            row(Cell::Null, &[("rating", Cell::Real(4.0))]),
            row(Cell::Null, &[("rating", Cell::Null)]),
            row(Cell::Null, &[("rating", Cell::Real(3.5))]),
            row(Cell::Null, &[("rating", Cell::Text("n/a".into()))]),
        ];
        let rows: Vec<&MetricRow> = rows.iter().collect();
        assert_eq!(compute_metric(&MetricDef::count("n"), &rows), Some(4.0));
        let avg = MetricDef::stat("avg", Aggregate::Average, "rating");
        assert_eq!(compute_metric(&avg, &rows), Some(3.75));
    }

    #[test]
    fn empty_inputs_follow_the_metric_policy() {
        let rows = vec![row(Cell::Null, &[("rating", Cell::Null)])];
        let rows: Vec<&MetricRow> = rows.iter().collect();
        let nullable = MetricDef::stat("avg", Aggregate::Average, "rating");
        assert_eq!(compute_metric(&nullable, &rows), None);
        assert_eq!(compute_metric(&nullable.or_zero(), &rows), Some(0.0));
        assert_eq!(compute_metric(&MetricDef::sum("total", "rating"), &rows), Some(0.0));
    }

    #[test]
    fn median_distinct_and_rounding() {
        let rows: Vec<MetricRow> = [1200, 300, 800, 300]
            .iter()
            .map(|w| row(Cell::Null, &[("words", Cell::Integer(*w))]))
            .collect();
        let rows: Vec<&MetricRow> = rows.iter().collect();
        let median_words = MetricDef::stat("median", Aggregate::Median, "words").integer();
        assert_eq!(compute_metric(&median_words, &rows), Some(550.0));
        let distinct = MetricDef::count_distinct("unique", "words");
        assert_eq!(compute_metric(&distinct, &rows), Some(3.0));
        let avg = MetricDef::stat("avg", Aggregate::Average, "words");
        assert_eq!(compute_metric(&avg, &rows), Some(650.0));

        let thirds: Vec<MetricRow> = [1.0, 1.0, 2.0]
            .iter()
            .map(|v| row(Cell::Null, &[("x", Cell::Real(*v))]))
            .collect();
        let thirds: Vec<&MetricRow> = thirds.iter().collect();
        let avg = MetricDef::stat("avg", Aggregate::Average, "x");
        assert_eq!(compute_metric(&avg, &thirds), Some(1.33));
    }

    async fn strong_store(dir: &std::path::Path) -> SourceStore {
        let store = SourceStore::open(definition_for(SourceId::Strong), dir)
            .await
            .expect("open");
        store.init_tables().await.expect("init");
        let mut unit = store.begin().await.expect("begin");
        let workouts = [
            ("w1", "2025-02-27 07:00:00", 60),
            ("w2", "2025-03-03 07:00:00", 45),
            ("w3", "2025-03-05 07:00:00", 30),
        ];
        for (id, started, minutes) in workouts {
            unit.upsert(
                &SourceRecord::new("workout", id)
                    .field("workout_name", "Push")
                    .field("started_at", started)
                    .field("duration_minutes", minutes),
            )
            .await
            .expect("workout");
        }
        let sets = [("s1", "w1", "Bench"), ("s2", "w2", "Bench"), ("s3", "w2", "Squat"), ("s4", "w3", "Bench")];
        for (id, workout, exercise) in sets {
            unit.upsert(
                &SourceRecord::new("workout_set", id)
                    .field("exercise_name", exercise)
                    .field("set_order", 1)
                    .parent("workout", Some(workout.to_string()), None),
            )
            .await
            .expect("set");
        }
        unit.commit().await.expect("commit");
        store
    }

    #[tokio::test]
    async fn joined_metrics_bucket_by_the_parent_timestamp() {
        let dir = tempdir().expect("tempdir");
        let store = strong_store(dir.path()).await;
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().expect("now");

        let written = AggregationEngine.analyze_at(&store, now).await.expect("analyze");
        assert_eq!(written, 2);

        let march = store
            .analysis_row(&YearMonth::parse("2025-03").expect("period"))
            .await
            .expect("row")
            .expect("march");
        assert_eq!(march.get("workouts"), Some(2.0));
        assert_eq!(march.get("total_minutes"), Some(75.0));
        assert_eq!(march.get("total_sets"), Some(3.0));
        assert_eq!(march.get("unique_exercises"), Some(2.0));
        assert_eq!(march.updated_at, "2025-04-01T00:00:00Z");
    }

    #[tokio::test]
    async fn reanalysis_converges() {
        let dir = tempdir().expect("tempdir");
        let store = strong_store(dir.path()).await;
        let now = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).single().expect("now");

        AggregationEngine.analyze_at(&store, now).await.expect("first");
        let first = store.analysis_rows().await.expect("rows");
        AggregationEngine.analyze_at(&store, now).await.expect("second");
        let second = store.analysis_rows().await.expect("rows");
        assert_eq!(first, second);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn cleared_upstream_rating_drops_out_of_the_average() {
        use footprint_adapters::sources::hardcover::normalize_user_book;
        use serde_json::{json, Value as JsonValue};

        let dir = tempdir().expect("tempdir");
        let store = SourceStore::open(definition_for(SourceId::Hardcover), dir.path())
            .await
            .expect("open");
        store.init_tables().await.expect("init");
        let user_book = |rating: JsonValue| {
            json!({
                "id": 7,
                "rating": rating,
                "date_added": "2025-03-02",
                "reviewed_at": "2025-03-10",
                "book": {"slug": "dune", "title": "Dune"}
            })
        };

        for rating in [json!(4.5), JsonValue::Null] {
            let record = normalize_user_book(&user_book(rating)).expect("book");
            let mut unit = store.begin().await.expect("begin");
            unit.upsert(&record).await.expect("upsert");
            unit.commit().await.expect("commit");
        }
        AggregationEngine.analyze(&store).await.expect("analyze");

        let march = store
            .analysis_row(&YearMonth::parse("2025-03").expect("period"))
            .await
            .expect("row")
            .expect("march");
        assert_eq!(march.get("books_finished"), Some(1.0));
        assert_eq!(march.get("avg_rating"), None);
    }
}
