//! Month-over-month and year-over-year comparisons of named metrics.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::period::{PeriodError, YearMonth};

/// Metric values of one analysis row; NULL metrics are simply absent.
pub type MetricMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricChange {
    pub mom: Option<f64>,
    pub yoy: Option<f64>,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Signed percentage change rounded to one decimal place. Undefined when
/// either side is missing or the previous value is zero.
pub fn percentage_change(current: Option<f64>, previous: Option<f64>) -> Option<f64> {
    let previous = previous.filter(|p| *p != 0.0)?;
    let current = current?;
    let change = round_to(((current - previous) / previous) * 100.0, 1);
    change.is_finite().then_some(change)
}

/// Change of a ratio metric derived from the changes of its numerator and
/// denominator, e.g. reading speed from words and minutes.
pub fn ratio_change(numerator_change: Option<f64>, denominator_change: Option<f64>) -> Option<f64> {
    let numerator_ratio = 1.0 + numerator_change? / 100.0;
    let denominator_ratio = 1.0 + denominator_change? / 100.0;
    if denominator_ratio == 0.0 {
        return None;
    }
    Some(round_to((numerator_ratio / denominator_ratio - 1.0) * 100.0, 1))
}

/// Computes MoM/YoY changes for `metrics`, looking history up through
/// `lookup`. A period without data is a valid outcome; a malformed `period`
/// is not.
pub fn compute_comparisons<F>(
    current: &MetricMap,
    mut lookup: F,
    period: &str,
    metrics: &[&str],
) -> Result<BTreeMap<String, MetricChange>, PeriodError>
where
    F: FnMut(&YearMonth) -> Option<MetricMap>,
{
    let periods = YearMonth::parse(period)?.comparison_periods();
    let mom_stats = lookup(&periods.mom);
    let yoy_stats = lookup(&periods.yoy);

    Ok(metrics
        .iter()
        .map(|metric| {
            let value = current.get(*metric).copied();
            let mom = mom_stats.as_ref().and_then(|s| s.get(*metric).copied());
            let yoy = yoy_stats.as_ref().and_then(|s| s.get(*metric).copied());
            (
                metric.to_string(),
                MetricChange {
                    mom: percentage_change(value, mom),
                    yoy: percentage_change(value, yoy),
                },
            )
        })
        .collect())
}

pub fn format_change(change: Option<f64>) -> String {
    match change {
        None => "N/A".to_string(),
        Some(c) if c >= 0.0 => format!("+{c:.0}%"),
        Some(c) => format!("{c:.0}%"),
    }
}

/// `" (+15% MoM, -5% YoY)"`, or empty when there is nothing to compare.
pub fn comparison_suffix(change: Option<&MetricChange>) -> String {
    match change {
        None => String::new(),
        Some(change) => format!(
            " ({} MoM, {} YoY)",
            format_change(change.mom),
            format_change(change.yoy)
        ),
    }
}
