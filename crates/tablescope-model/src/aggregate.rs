use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn sql_name(self) -> &'static str {
        match self {
            AggregateFunction::Count | AggregateFunction::CountDistinct => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }

    fn label(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::CountDistinct => "count_distinct",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// One output column of a group-by: `function(column) AS alias`.
///
/// `column: None` is only meaningful for [`AggregateFunction::Count`] (`COUNT(*)`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub function: AggregateFunction,
    pub column: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregate {
    pub fn count_rows() -> Self {
        Self {
            function: AggregateFunction::Count,
            column: None,
            alias: None,
        }
    }

    pub fn of(function: AggregateFunction, column: impl Into<String>) -> Self {
        Self {
            function,
            column: Some(column.into()),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Output column name (explicit alias, or `<function>_<column>`).
    pub fn output_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        match &self.column {
            Some(column) => format!("{}_{}", self.function.label(), column),
            None => self.function.label().to_string(),
        }
    }
}

/// Group-by request backing a derived summary session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub group_by: Vec<String>,
    pub aggregates: Vec<Aggregate>,
}

impl AggregationSpec {
    pub fn new(group_by: Vec<String>, aggregates: Vec<Aggregate>) -> Self {
        Self {
            group_by,
            aggregates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.group_by.is_empty() && self.aggregates.is_empty()
    }
}
