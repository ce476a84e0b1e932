//! Column profiler: statistics over the filtered view.

use serde::{Deserialize, Serialize};
use tablescope_model::{find_column, user_columns, CellValue, ColumnDescriptor, DisplayType};
use tablescope_sql::profile as queries;

use crate::config::SessionConfig;
use crate::engine::{EngineGateway, QueryResult};
use crate::error::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileRequest {
    Overview,
    Descriptive { column: String },
    Histogram { column: String, bins: Option<u32> },
    Frequency { column: String, limit: Option<u64> },
    BooleanCounts { column: String },
    TopValues { column: String, limit: Option<u64> },
    Distribution { column: String },
}

impl ProfileRequest {
    pub fn column(&self) -> Option<&str> {
        match self {
            ProfileRequest::Overview => None,
            ProfileRequest::Descriptive { column }
            | ProfileRequest::Histogram { column, .. }
            | ProfileRequest::Frequency { column, .. }
            | ProfileRequest::BooleanCounts { column }
            | ProfileRequest::TopValues { column, .. }
            | ProfileRequest::Distribution { column } => Some(column),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnOverview {
    pub name: String,
    pub display_type: DisplayType,
    pub non_null: u64,
    pub nulls: u64,
    pub distinct: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overview {
    pub rows: u64,
    pub columns: Vec<ColumnOverview>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptiveStats {
    pub rows: u64,
    pub non_null: u64,
    pub distinct: u64,
    pub min: CellValue,
    pub max: CellValue,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub q1: Option<f64>,
    pub median: Option<f64>,
    pub q3: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lo: f64,
    pub hi: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub bins: Vec<HistogramBin>,
}

impl Histogram {
    pub fn total(&self) -> u64 {
        self.bins.iter().map(|b| b.count).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BooleanCounts {
    pub true_count: u64,
    pub false_count: u64,
    pub null_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Distribution {
    /// Every value with its count; used at or below the categorical threshold.
    Categorical { values: Vec<ValueCount> },
    /// Equal-width histogram for high-cardinality numeric columns.
    Binned { histogram: Histogram },
    /// Most frequent values plus cardinality for everything else.
    TopN {
        values: Vec<ValueCount>,
        distinct: u64,
        non_null: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "profile", rename_all = "snake_case")]
pub enum ProfileResult {
    Overview(Overview),
    Descriptive(DescriptiveStats),
    Histogram(Histogram),
    Frequency { values: Vec<ValueCount> },
    BooleanCounts(BooleanCounts),
    TopValues { values: Vec<ValueCount> },
    Distribution(Distribution),
}

/// What a profile request resolved to.
///
/// `Stale` means the view or data changed while the request was running; the
/// caller should ask again.
#[derive(Debug, Clone, PartialEq)]
pub enum ProfileOutcome {
    Ready(ProfileResult),
    Stale,
}

impl ProfileOutcome {
    pub fn into_result(self) -> Option<ProfileResult> {
        match self {
            ProfileOutcome::Ready(result) => Some(result),
            ProfileOutcome::Stale => None,
        }
    }
}

/// Run `request` against `relation` (the filtered view).
pub(crate) fn run_profile(
    engine: &EngineGateway,
    relation: &str,
    columns: &[ColumnDescriptor],
    request: &ProfileRequest,
    config: &SessionConfig,
) -> Result<ProfileResult> {
    if let Some(name) = request.column() {
        if find_column(columns, name).is_none() {
            return Err(SessionError::UnknownColumn(name.to_string()));
        }
    }
    let display_type = |name: &str| {
        find_column(columns, name)
            .map(|c| c.display_type)
            .unwrap_or(DisplayType::Unknown)
    };

    Ok(match request {
        ProfileRequest::Overview => ProfileResult::Overview(overview(engine, relation, columns)?),
        ProfileRequest::Descriptive { column } => ProfileResult::Descriptive(descriptive(
            engine,
            relation,
            column,
            display_type(column),
        )?),
        ProfileRequest::Histogram { column, bins } => ProfileResult::Histogram(histogram(
            engine,
            relation,
            column,
            bins.unwrap_or(config.histogram_bins),
        )?),
        ProfileRequest::Frequency { column, limit } => ProfileResult::Frequency {
            values: frequencies(engine, relation, column, *limit)?,
        },
        ProfileRequest::BooleanCounts { column } => {
            ProfileResult::BooleanCounts(boolean_counts(engine, relation, column)?)
        }
        ProfileRequest::TopValues { column, limit } => ProfileResult::TopValues {
            values: frequencies(
                engine,
                relation,
                column,
                Some(limit.unwrap_or(config.top_values_limit)),
            )?,
        },
        ProfileRequest::Distribution { column } => ProfileResult::Distribution(distribution(
            engine,
            relation,
            column,
            display_type(column),
            config,
        )?),
    })
}

fn count_at(result: &QueryResult, row: usize, col: usize) -> u64 {
    result
        .value(row, col)
        .and_then(CellValue::as_i64)
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(0)
}

fn float_at(result: &QueryResult, row: usize, col: usize) -> Option<f64> {
    result.value(row, col).and_then(CellValue::as_f64)
}

pub(crate) fn overview(
    engine: &EngineGateway,
    relation: &str,
    columns: &[ColumnDescriptor],
) -> Result<Overview> {
    let visible: Vec<&ColumnDescriptor> = user_columns(columns).collect();
    let result = engine.query(&queries::column_stats_query(
        relation,
        visible.iter().copied(),
    ))?;
    let rows = count_at(&result, 0, 0);
    let columns = visible
        .into_iter()
        .enumerate()
        .map(|(idx, column)| {
            let non_null = count_at(&result, 0, 1 + idx * 2);
            ColumnOverview {
                name: column.name.clone(),
                display_type: column.display_type,
                non_null,
                nulls: rows.saturating_sub(non_null),
                distinct: count_at(&result, 0, 2 + idx * 2),
            }
        })
        .collect();
    Ok(Overview { rows, columns })
}

fn descriptive(
    engine: &EngineGateway,
    relation: &str,
    column: &str,
    display_type: DisplayType,
) -> Result<DescriptiveStats> {
    let result = engine.query(&queries::descriptive_stats_query(relation, column, display_type))?;
    let value = |col: usize| result.value(0, col).cloned().unwrap_or_default();
    Ok(DescriptiveStats {
        rows: count_at(&result, 0, 0),
        non_null: count_at(&result, 0, 1),
        distinct: count_at(&result, 0, 2),
        min: value(3),
        max: value(4),
        mean: float_at(&result, 0, 5),
        stddev: float_at(&result, 0, 6),
        q1: float_at(&result, 0, 7),
        median: float_at(&result, 0, 8),
        q3: float_at(&result, 0, 9),
    })
}

pub(crate) fn histogram(
    engine: &EngineGateway,
    relation: &str,
    column: &str,
    bins: u32,
) -> Result<Histogram> {
    let bins = bins.max(1);
    let result = engine.query(&queries::histogram_query(relation, column, bins))?;
    if result.row_count() == 0 {
        return Ok(Histogram::default());
    }
    let (Some(lo), Some(hi)) = (float_at(&result, 0, 2), float_at(&result, 0, 3)) else {
        return Ok(Histogram::default());
    };

    if hi <= lo {
        let count = (0..result.row_count()).map(|r| count_at(&result, r, 1)).sum();
        return Ok(Histogram {
            bins: vec![HistogramBin { lo, hi, count }],
        });
    }

    let width = (hi - lo) / f64::from(bins);
    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lo: lo + width * f64::from(i),
            hi: if i + 1 == bins { hi } else { lo + width * f64::from(i + 1) },
            count: 0,
        })
        .collect();
    for row in 0..result.row_count() {
        let bin = result
            .value(row, 0)
            .and_then(CellValue::as_i64)
            .and_then(|b| usize::try_from(b).ok());
        if let Some(slot) = bin.and_then(|b| out.get_mut(b)) {
            slot.count += count_at(&result, row, 1);
        }
    }
    Ok(Histogram { bins: out })
}

pub(crate) fn frequencies(
    engine: &EngineGateway,
    relation: &str,
    column: &str,
    limit: Option<u64>,
) -> Result<Vec<ValueCount>> {
    let result = engine.query(&queries::frequency_query(relation, column, limit))?;
    Ok((0..result.row_count())
        .map(|row| ValueCount {
            value: result
                .value(row, 0)
                .and_then(CellValue::to_plain_text)
                .unwrap_or_default(),
            count: count_at(&result, row, 1),
        })
        .collect())
}

pub(crate) fn boolean_counts(
    engine: &EngineGateway,
    relation: &str,
    column: &str,
) -> Result<BooleanCounts> {
    let result = engine.query(&queries::boolean_counts_query(relation, column))?;
    Ok(BooleanCounts {
        true_count: count_at(&result, 0, 0),
        false_count: count_at(&result, 0, 1),
        null_count: count_at(&result, 0, 2),
    })
}

fn distribution(
    engine: &EngineGateway,
    relation: &str,
    column: &str,
    display_type: DisplayType,
    config: &SessionConfig,
) -> Result<Distribution> {
    let cardinality = engine.query(&queries::cardinality_query(relation, column))?;
    let non_null = count_at(&cardinality, 0, 1);
    let distinct = count_at(&cardinality, 0, 2);

    if distinct <= config.categorical_threshold {
        return Ok(Distribution::Categorical {
            values: frequencies(engine, relation, column, None)?,
        });
    }
    if display_type.is_numeric() {
        return Ok(Distribution::Binned {
            histogram: histogram(engine, relation, column, config.histogram_bins)?,
        });
    }
    Ok(Distribution::TopN {
        values: frequencies(engine, relation, column, Some(config.top_values_limit))?,
        distinct,
        non_null,
    })
}
