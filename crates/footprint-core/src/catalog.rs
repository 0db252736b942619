//! Static description of a source: entity tables for the record store and
//! metric queries for the monthly aggregation.

use crate::SourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Real,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
}

pub const fn column(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef { name, ty }
}

/// Foreign key from a dependent entity to its parent's natural key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentDef {
    pub entity: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDef {
    pub entity: &'static str,
    pub table: &'static str,
    /// Natural key column; unique per table.
    pub key_column: &'static str,
    /// Non-key columns, including the parent foreign key column if any.
    pub columns: &'static [ColumnDef],
    pub parent: Option<ParentDef>,
}

impl EntityDef {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    /// Rows in the bucket.
    Count,
    /// Distinct non-null values of the input column.
    CountDistinct,
    Sum,
    Average,
    Min,
    Max,
    Median,
}

/// Value stored for a metric whose bucket had no qualifying input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyValue {
    Zero,
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    /// Column in the `analysis` table.
    pub column: &'static str,
    pub aggregate: Aggregate,
    /// Column of the metric query feeding the aggregate; unused by `Count`.
    pub input: Option<&'static str>,
    pub ty: ColumnType,
    pub empty: EmptyValue,
}

impl MetricDef {
    pub const fn count(column: &'static str) -> Self {
        Self {
            column,
            aggregate: Aggregate::Count,
            input: None,
            ty: ColumnType::Integer,
            empty: EmptyValue::Zero,
        }
    }

    pub const fn count_distinct(column: &'static str, input: &'static str) -> Self {
        Self {
            column,
            aggregate: Aggregate::CountDistinct,
            input: Some(input),
            ty: ColumnType::Integer,
            empty: EmptyValue::Zero,
        }
    }

    pub const fn sum(column: &'static str, input: &'static str) -> Self {
        Self {
            column,
            aggregate: Aggregate::Sum,
            input: Some(input),
            ty: ColumnType::Integer,
            empty: EmptyValue::Zero,
        }
    }

    /// Real-valued statistic (average, extrema, median) that is NULL for an
    /// empty bucket unless `or_zero` is applied.
    pub const fn stat(column: &'static str, aggregate: Aggregate, input: &'static str) -> Self {
        Self {
            column,
            aggregate,
            input: Some(input),
            ty: ColumnType::Real,
            empty: EmptyValue::Null,
        }
    }

    pub const fn integer(mut self) -> Self {
        self.ty = ColumnType::Integer;
        self
    }

    pub const fn or_zero(mut self) -> Self {
        self.empty = EmptyValue::Zero;
        self
    }
}

/// One scan over a source's raw tables. The first selected column must be
/// named `bucket_ts` and hold the designated timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricQuery {
    pub name: &'static str,
    pub sql: &'static str,
    pub metrics: &'static [MetricDef],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceDefinition {
    pub source: SourceId,
    pub entities: &'static [EntityDef],
    pub metric_queries: &'static [MetricQuery],
    /// Metrics the report compares month over month and year over year.
    pub comparison_metrics: &'static [&'static str],
}

impl SourceDefinition {
    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.entity == name)
    }

    pub fn analysis_metrics(&self) -> impl Iterator<Item = &MetricDef> {
        self.metric_queries.iter().flat_map(|q| q.metrics.iter())
    }
}
