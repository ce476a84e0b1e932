use serde::{Deserialize, Serialize};
use tablescope_model::{ColumnDescriptor, DisplayType};

use crate::config::SessionConfig;
use crate::engine::EngineGateway;
use crate::error::Result;
use crate::profile::{self, BooleanCounts, Histogram, Overview, ValueCount};

/// Per-column header summary shown above the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub column: String,
    pub display_type: DisplayType,
    pub non_null: u64,
    pub nulls: u64,
    pub distinct: u64,
    pub shape: SummaryShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryShape {
    Boolean { counts: BooleanCounts },
    Histogram { histogram: Histogram },
    TopValues { values: Vec<ValueCount> },
    /// Too many distinct values to chart; only the counts above apply.
    Cardinality,
}

/// Null and distinct counts for every user column in one query.
pub(crate) fn base_stats(
    engine: &EngineGateway,
    relation: &str,
    columns: &[ColumnDescriptor],
) -> Result<Overview> {
    profile::overview(engine, relation, columns)
}

/// Chart data for one column, chosen from its type and cardinality.
pub(crate) fn column_summary(
    engine: &EngineGateway,
    relation: &str,
    base: &profile::ColumnOverview,
    config: &SessionConfig,
) -> Result<ColumnSummary> {
    let column = base.name.as_str();
    let shape = match base.display_type {
        DisplayType::Boolean => SummaryShape::Boolean {
            counts: profile::boolean_counts(engine, relation, column)?,
        },
        DisplayType::Integer | DisplayType::Float => SummaryShape::Histogram {
            histogram: profile::histogram(engine, relation, column, config.histogram_bins)?,
        },
        _ if base.distinct <= config.categorical_threshold => SummaryShape::TopValues {
            values: profile::frequencies(
                engine,
                relation,
                column,
                Some(config.top_values_limit),
            )?,
        },
        _ => SummaryShape::Cardinality,
    };
    Ok(ColumnSummary {
        column: base.name.clone(),
        display_type: base.display_type,
        non_null: base.non_null,
        nulls: base.nulls,
        distinct: base.distinct,
        shape,
    })
}
