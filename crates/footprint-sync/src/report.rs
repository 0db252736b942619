//! Monthly summary document and per-source activity history files.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use askama::Template;
use chrono::{DateTime, NaiveDate, Utc};
use footprint_core::{
    comparison_suffix, compute_comparisons, ratio_change, ColumnType, MetricChange, MetricMap,
    SourceId, YearMonth,
};
use footprint_storage::{format_timestamp, SourceStore};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};

use crate::publish::Artifact;

/// Words per minute, rounded; 0 when no reading time was recorded.
pub fn reading_speed(words: Option<f64>, minutes: Option<f64>) -> f64 {
    match (words, minutes) {
        (Some(words), Some(minutes)) if minutes > 0.0 => (words / minutes).round(),
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReadingSpeed {
    pub words_per_minute: f64,
    pub change: MetricChange,
}

/// One source's numbers for the report month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSection {
    pub source: SourceId,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub changes: BTreeMap<String, MetricChange>,
    pub reading_speed: Option<ReadingSpeed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlyReport {
    pub period: YearMonth,
    pub generated_at: DateTime<Utc>,
    pub sections: Vec<SourceSection>,
}

/// Everything one publish writes.
#[derive(Debug, Clone, Default)]
pub struct ReportBundle {
    /// Month of the summary document, if any source has analysis rows.
    pub period: Option<YearMonth>,
    pub artifacts: Vec<Artifact>,
}

impl ReportBundle {
    pub fn commit_message(&self) -> String {
        match &self.period {
            Some(period) => format!("Update digital footprint for {period}"),
            None => "Update digital footprint".to_string(),
        }
    }
}

/// One month of a source's history file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub year_month: String,
    #[serde(flatten)]
    pub metrics: BTreeMap<String, JsonValue>,
}

struct MetricLine {
    label: String,
    value: String,
    suffix: String,
}

struct SectionView {
    id: String,
    name: String,
    lines: Vec<MetricLine>,
}

#[derive(Template)]
#[template(path = "monthly_report.md", escape = "none")]
struct MonthlyReportTemplate {
    title: String,
    period: String,
    generated_at: String,
    sections: Vec<SectionView>,
}

fn month_label(period: &YearMonth) -> String {
    NaiveDate::from_ymd_opt(period.year(), period.month(), 1)
        .map(|date| date.format("%B %Y").to_string())
        .unwrap_or_else(|| period.to_string())
}

fn format_value(value: Option<f64>, ty: ColumnType) -> String {
    match value {
        None => "n/a".to_string(),
        Some(v) if ty == ColumnType::Integer || v.fract() == 0.0 => format!("{v:.0}"),
        Some(v) => format!("{v:.2}"),
    }
}

impl SourceSection {
    fn view(&self) -> SectionView {
        let definition = footprint_adapters::definition_for(self.source);
        let mut lines: Vec<MetricLine> = definition
            .analysis_metrics()
            .map(|metric| MetricLine {
                label: metric.column.replace('_', " "),
                value: format_value(
                    self.metrics.get(metric.column).copied().flatten(),
                    metric.ty,
                ),
                suffix: comparison_suffix(self.changes.get(metric.column)),
            })
            .collect();
        if let Some(speed) = &self.reading_speed {
            lines.push(MetricLine {
                label: "reading speed".to_string(),
                value: format!("{:.0} words/min", speed.words_per_minute),
                suffix: comparison_suffix(Some(&speed.change)),
            });
        }
        SectionView {
            id: self.source.to_string(),
            name: self.source.display_name().to_string(),
            lines,
        }
    }
}

impl MonthlyReport {
    pub fn title(&self) -> String {
        format!("Digital footprint: {}", month_label(&self.period))
    }

    /// Markdown with YAML front matter.
    pub fn render_markdown(&self) -> Result<String> {
        MonthlyReportTemplate {
            title: self.title(),
            period: self.period.to_string(),
            generated_at: format_timestamp(self.generated_at),
            sections: self.sections.iter().map(SourceSection::view).collect(),
        }
        .render()
        .context("rendering monthly report")
    }

    pub fn relative_path(&self) -> String {
        format!("reports/{}.md", self.period)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportGenerator;

impl ReportGenerator {
    /// The source's analysis row for `period` with MoM/YoY changes of its
    /// comparison metrics, or `None` when the month has no row.
    pub async fn section(&self, store: &SourceStore, period: YearMonth) -> Result<Option<SourceSection>> {
        let Some(current) = store.analysis_row(&period).await? else {
            return Ok(None);
        };
        let definition = store.definition();
        let periods = period.comparison_periods();
        let mom = store
            .analysis_row(&periods.mom)
            .await?
            .map(|row| row.metric_map());
        let yoy = store
            .analysis_row(&periods.yoy)
            .await?
            .map(|row| row.metric_map());
        let lookup = |requested: &YearMonth| -> Option<MetricMap> {
            if *requested == periods.mom {
                mom.clone()
            } else if *requested == periods.yoy {
                yoy.clone()
            } else {
                None
            }
        };
        let changes = compute_comparisons(
            &current.metric_map(),
            lookup,
            &period.to_string(),
            definition.comparison_metrics,
        )
        .with_context(|| format!("comparing {} for {period}", definition.source))?;

        let reading_speed = (definition.source == SourceId::Readwise).then(|| {
            let words = changes.get("words").copied().unwrap_or_default();
            let minutes = changes.get("reading_time_mins").copied().unwrap_or_default();
            ReadingSpeed {
                words_per_minute: reading_speed(current.get("words"), current.get("reading_time_mins")),
                change: MetricChange {
                    mom: ratio_change(words.mom, minutes.mom),
                    yoy: ratio_change(words.yoy, minutes.yoy),
                },
            }
        });

        Ok(Some(SourceSection {
            source: definition.source,
            metrics: current.metrics,
            changes,
            reading_speed,
        }))
    }

    /// Report for the latest month any source has analysed, or `None` when
    /// no source has analysis rows yet.
    pub async fn build(
        &self,
        stores: &[SourceStore],
        generated_at: DateTime<Utc>,
    ) -> Result<Option<MonthlyReport>> {
        let mut latest: Option<YearMonth> = None;
        for store in stores {
            let summary = store.analysis_summary().await?;
            latest = latest.max(summary.latest);
        }
        let Some(period) = latest else {
            return Ok(None);
        };

        let mut sections = Vec::new();
        for store in stores {
            if let Some(section) = self.section(store, period).await? {
                sections.push(section);
            }
        }
        Ok(Some(MonthlyReport {
            period,
            generated_at,
            sections,
        }))
    }

    /// Every analysed month of a source, oldest first.
    pub async fn history(&self, store: &SourceStore) -> Result<Vec<HistoryEntry>> {
        let definition = store.definition();
        let rows = store.analysis_rows().await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut metrics: BTreeMap<String, JsonValue> = definition
                    .analysis_metrics()
                    .map(|metric| {
                        let value = match (row.get(metric.column), metric.ty) {
                            (None, _) => JsonValue::Null,
                            (Some(v), ColumnType::Integer) => json!(v.round() as i64),
                            (Some(v), _) => json!(v),
                        };
                        (metric.column.to_string(), value)
                    })
                    .collect();
                if definition.source == SourceId::Readwise {
                    let speed = reading_speed(row.get("words"), row.get("reading_time_mins"));
                    metrics.insert("avg_reading_speed".to_string(), json!(speed as i64));
                }
                HistoryEntry {
                    year_month: row.period.to_string(),
                    metrics,
                }
            })
            .collect())
    }

    /// The monthly report plus one history file per source with data.
    pub async fn artifacts(
        &self,
        stores: &[SourceStore],
        generated_at: DateTime<Utc>,
    ) -> Result<ReportBundle> {
        let mut bundle = ReportBundle::default();
        if let Some(report) = self.build(stores, generated_at).await? {
            bundle.period = Some(report.period);
            bundle
                .artifacts
                .push(Artifact::new(report.relative_path(), report.render_markdown()?));
        }
        for store in stores {
            let history = self.history(store).await?;
            if history.is_empty() {
                continue;
            }
            let yaml = serde_yaml::to_string(&history)
                .with_context(|| format!("serializing {} history", store.source()))?;
            bundle.artifacts.push(Artifact::new(
                format!("data/activity/{}.yaml", store.source().activity_kind()),
                yaml,
            ));
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reading_speed_handles_missing_minutes() {
        assert_eq!(reading_speed(Some(50_000.0), Some(200.0)), 250.0);
        assert_eq!(reading_speed(Some(1_000.0), Some(3.0)), 333.0);
        assert_eq!(reading_speed(Some(50_000.0), Some(0.0)), 0.0);
        assert_eq!(reading_speed(None, Some(10.0)), 0.0);
    }

    #[test]
    fn values_render_by_column_type() {
        assert_eq!(format_value(Some(12.0), ColumnType::Integer), "12");
        assert_eq!(format_value(Some(3.75), ColumnType::Real), "3.75");
        assert_eq!(format_value(Some(4.0), ColumnType::Real), "4");
        assert_eq!(format_value(None, ColumnType::Real), "n/a");
    }

    #[test]
    fn markdown_has_front_matter_and_comparisons() {
        let report = MonthlyReport {
            period: YearMonth::parse("2025-03").expect("period"),
            generated_at: DateTime::parse_from_rfc3339("2025-04-01T08:00:00Z")
                .expect("ts")
                .with_timezone(&Utc),
            sections: vec![SourceSection {
                source: SourceId::Github,
                metrics: BTreeMap::from([
                    ("commits".to_string(), Some(42.0)),
                    ("repos_touched".to_string(), Some(3.0)),
                ]),
                changes: BTreeMap::from([(
                    "commits".to_string(),
                    MetricChange {
                        mom: Some(15.0),
                        yoy: None,
                    },
                )]),
                reading_speed: None,
            }],
        };

        let markdown = report.render_markdown().expect("render");
        assert!(markdown.starts_with("---\ntitle: \"Digital footprint: March 2025\""));
        assert!(markdown.contains("period: \"2025-03\""));
        assert!(markdown.contains("  - github"));
        assert!(markdown.contains("## GitHub"));
        assert!(markdown.contains("- commits: 42 (+15% MoM, N/A YoY)"));
        assert!(markdown.contains("- repos touched: 3\n") || markdown.ends_with("- repos touched: 3"));
        assert_eq!(report.relative_path(), "reports/2025-03.md");
    }
}
