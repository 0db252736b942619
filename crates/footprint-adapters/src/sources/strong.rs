//! Strong workout log from the app's CSV export, one row per set.

use std::collections::BTreeSet;

use footprint_core::catalog::column;
use footprint_core::{
    ColumnDef, ColumnType, EntityDef, MetricDef, MetricQuery, ParentDef, SourceDefinition,
    SourceId, SourceRecord,
};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use crate::bundle::{BundleConnector, ExportBundle};
use crate::json::{composite_key, f64_at, parse_minutes, present, str_at};
use crate::ConnectorSettings;

const SOURCE: SourceId = SourceId::Strong;

const WORKOUT_COLUMNS: &[ColumnDef] = &[
    column("workout_name", ColumnType::Text),
    column("started_at", ColumnType::Text),
    column("duration_minutes", ColumnType::Integer),
    column("notes", ColumnType::Text),
];

const SET_COLUMNS: &[ColumnDef] = &[
    column("workout_id", ColumnType::Text),
    column("exercise_name", ColumnType::Text),
    column("set_order", ColumnType::Integer),
    column("weight", ColumnType::Real),
    column("reps", ColumnType::Real),
    column("distance", ColumnType::Real),
    column("seconds", ColumnType::Real),
    column("notes", ColumnType::Text),
    column("rpe", ColumnType::Real),
];

pub static DEFINITION: SourceDefinition = SourceDefinition {
    source: SOURCE,
    entities: &[
        EntityDef {
            entity: "workout",
            table: "workouts",
            key_column: "workout_id",
            columns: WORKOUT_COLUMNS,
            parent: None,
        },
        EntityDef {
            entity: "workout_set",
            table: "workout_sets",
            key_column: "set_id",
            columns: SET_COLUMNS,
            parent: Some(ParentDef {
                entity: "workout",
                column: "workout_id",
            }),
        },
    ],
    metric_queries: &[
        MetricQuery {
            name: "workouts",
            sql: "SELECT started_at AS bucket_ts, duration_minutes FROM workouts \
                  WHERE started_at IS NOT NULL",
            metrics: &[
                MetricDef::count("workouts"),
                MetricDef::sum("total_minutes", "duration_minutes"),
            ],
        },
        MetricQuery {
            name: "sets",
            sql: "SELECT w.started_at AS bucket_ts, s.exercise_name \
                  FROM workout_sets s \
                  JOIN workouts w ON w.workout_id = s.workout_id \
                  WHERE w.started_at IS NOT NULL",
            metrics: &[
                MetricDef::count_distinct("unique_exercises", "exercise_name"),
                MetricDef::count("total_sets"),
            ],
        },
    ],
    comparison_metrics: &["workouts", "total_minutes"],
};

fn number(row: &JsonValue, name: &str) -> Option<JsonValue> {
    present(row, &[name], f64_at)
}

/// Workouts first, in export order, then their sets. Rest timer rows and
/// rows with a non-numeric set order are not sets.
pub fn normalize(bundle: &ExportBundle) -> Vec<SourceRecord> {
    let mut seen = BTreeSet::new();
    let mut workouts = Vec::new();
    let mut sets = Vec::new();

    for row in bundle.rows("sets") {
        let (Some(started_at), Some(name)) = (str_at(row, &["Date"]), str_at(row, &["Workout Name"])) else {
            debug!(?row, "set row without workout date or name");
            continue;
        };
        let workout_id = composite_key(&[started_at, name]);
        let workout = SourceRecord::new("workout", workout_id.clone())
            .field("workout_name", name)
            .field("started_at", started_at)
            .field(
                "duration_minutes",
                json!(str_at(row, &["Duration"]).and_then(parse_minutes)),
            )
            .field_opt("notes", present(row, &["Workout Notes"], str_at));

        let order = str_at(row, &["Set Order"]).unwrap_or_default();
        let set_order = order.parse::<i64>().ok();
        if let Some(set_order) = set_order {
            let exercise = str_at(row, &["Exercise Name"]).unwrap_or_default();
            sets.push(
                SourceRecord::new(
                    "workout_set",
                    composite_key(&[workout_id.as_str(), exercise, order]),
                )
                .field("exercise_name", exercise)
                .field("set_order", set_order)
                .field_opt("weight", number(row, "Weight"))
                .field_opt("reps", number(row, "Reps"))
                .field_opt("distance", number(row, "Distance"))
                .field_opt("seconds", number(row, "Seconds"))
                .field_opt("notes", present(row, &["Notes"], str_at))
                .field_opt("rpe", number(row, "RPE"))
                .parent("workout", Some(workout_id.clone()), Some(workout.fields.clone())),
            );
        } else if order != "Rest Timer" {
            debug!(order, "skipping row with non-numeric set order");
        }

        if seen.insert(workout_id) {
            workouts.push(workout);
        }
    }

    workouts.into_iter().chain(sets).collect()
}

pub fn connector(settings: &ConnectorSettings) -> BundleConnector {
    BundleConnector::new(SOURCE, settings, normalize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fixtures::{fixture_path, load_bundle};

    fn records() -> Vec<SourceRecord> {
        let bundle = load_bundle(fixture_path("strong/export.json"));
        normalize(&bundle)
    }

    #[test]
    fn sets_reference_their_workout() {
        let records = records();
        let workouts: Vec<&SourceRecord> =
            records.iter().filter(|r| r.entity == "workout").collect();
        assert_eq!(workouts.len(), 2);
        assert_eq!(workouts[0].fields["workout_name"], "Push Day");
        assert_eq!(workouts[0].fields["duration_minutes"], 65);
        assert_eq!(workouts[1].fields["duration_minutes"], 40);

        let sets: Vec<&SourceRecord> = records
            .iter()
            .filter(|r| r.entity == "workout_set")
            .collect();
        assert_eq!(sets.len(), 4, "rest timers are not sets");
        for set in &sets {
            let parent = set.parent.as_ref().expect("parent");
            assert!(workouts
                .iter()
                .any(|w| Some(w.key.as_str()) == parent.key.as_deref()));
        }
        assert_eq!(sets[0].fields["weight"], 60.0);
        assert_eq!(sets[0].fields["rpe"], 8.0);
        assert!(sets[2].fields["rpe"].is_null(), "blank cells are explicit nulls");
    }

    #[test]
    fn identical_exports_give_identical_keys() {
        let first: Vec<String> = records().into_iter().map(|r| r.key).collect();
        let second: Vec<String> = records().into_iter().map(|r| r.key).collect();
        assert_eq!(first, second);
        let unique: BTreeSet<&String> = first.iter().collect();
        assert_eq!(unique.len(), first.len());
    }
}
