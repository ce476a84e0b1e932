//! Translation of a [`ViewState`] into paged and counting queries.

use std::collections::HashSet;
use std::ops::Range;

use tablescope_model::{
    find_column, user_columns, ColumnDescriptor, ColumnFilter, FilterOperator, FilterValue,
    ViewState, ROW_ID_COLUMN,
};

use crate::guard::{validate_expression, ExpressionError};
use crate::quote::{escape_clause, format_number, like_pattern, quote_identifier, quote_literal};

/// Deterministic query generation for one table.
///
/// The builder holds nothing but the table name; identical inputs always
/// produce identical SQL text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlBuilder {
    table: String,
}

impl SqlBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// The quoted base table name.
    pub fn table_ref(&self) -> String {
        quote_identifier(&self.table)
    }

    /// Relation the view reads from: the table itself, or a derived subquery
    /// adding every computed column. Computed columns are never materialized.
    pub fn source(&self, state: &ViewState) -> Result<String, ExpressionError> {
        if state.computed_columns.is_empty() {
            return Ok(self.table_ref());
        }

        let mut seen = HashSet::new();
        let mut select = String::from("(SELECT *");
        for computed in &state.computed_columns {
            if computed.name.trim().is_empty() || !seen.insert(computed.name.as_str()) {
                return Err(ExpressionError::InvalidName(computed.name.clone()));
            }
            validate_expression(&computed.expression)?;
            select.push_str(&format!(
                ", ({}) AS {}",
                computed.expression,
                quote_identifier(&computed.name)
            ));
        }
        select.push_str(" FROM ");
        select.push_str(&self.table_ref());
        select.push(')');
        Ok(select)
    }

    /// All row-restricting conditions, filters first, then the search chain.
    pub fn conditions(&self, state: &ViewState, columns: &[ColumnDescriptor]) -> Vec<String> {
        let mut conditions: Vec<String> = state.filters.iter().filter_map(filter_condition).collect();
        if let Some(term) = state.active_search() {
            if let Some(search) = search_condition(state, columns, term) {
                conditions.push(search);
            }
        }
        conditions
    }

    /// ` WHERE ...` (with leading space) or an empty string.
    pub fn where_clause(&self, state: &ViewState, columns: &[ColumnDescriptor]) -> String {
        let conditions = self.conditions(state, columns);
        if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        }
    }

    /// ` ORDER BY ...` (with leading space) or an empty string.
    ///
    /// Sort columns render in selection order; the identity column, when the
    /// table has one, is the final tie-breaker so `LIMIT/OFFSET` pages never
    /// overlap.
    pub fn order_clause(&self, state: &ViewState, columns: &[ColumnDescriptor]) -> String {
        let mut keys: Vec<String> = state
            .sort_columns
            .iter()
            .map(|sort| {
                format!(
                    "{} {} NULLS LAST",
                    quote_identifier(&sort.column),
                    sort.direction.sql_keyword()
                )
            })
            .collect();

        let sorts_by_identity = state.sort_columns.iter().any(|s| s.column == ROW_ID_COLUMN);
        if find_column(columns, ROW_ID_COLUMN).is_some() && !sorts_by_identity {
            keys.push(format!("{} ASC", quote_identifier(ROW_ID_COLUMN)));
        }

        if keys.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", keys.join(", "))
        }
    }

    /// `SELECT * FROM <source> [WHERE] [ORDER BY] LIMIT n OFFSET m`.
    pub fn page_query(
        &self,
        state: &ViewState,
        columns: &[ColumnDescriptor],
        rows: Range<u64>,
    ) -> Result<String, ExpressionError> {
        let limit = rows.end.saturating_sub(rows.start);
        Ok(format!(
            "SELECT * FROM {}{}{} LIMIT {limit} OFFSET {}",
            self.source(state)?,
            self.where_clause(state, columns),
            self.order_clause(state, columns),
            rows.start
        ))
    }

    pub fn count_query(
        &self,
        state: &ViewState,
        columns: &[ColumnDescriptor],
    ) -> Result<String, ExpressionError> {
        Ok(format!(
            "SELECT COUNT(*) FROM {}{}",
            self.source(state)?,
            self.where_clause(state, columns)
        ))
    }

    /// The filtered view as a relation usable in a `FROM` clause.
    pub fn filtered_relation(
        &self,
        state: &ViewState,
        columns: &[ColumnDescriptor],
    ) -> Result<String, ExpressionError> {
        let source = self.source(state)?;
        let where_clause = self.where_clause(state, columns);
        if where_clause.is_empty() {
            Ok(source)
        } else {
            Ok(format!("(SELECT * FROM {source}{where_clause})"))
        }
    }
}

fn text_of(column: &str) -> String {
    format!("CAST({} AS TEXT)", quote_identifier(column))
}

/// SQL for one filter, or `None` when the operator/value pair is invalid.
pub fn filter_condition(filter: &ColumnFilter) -> Option<String> {
    use FilterOperator::*;

    let column = quote_identifier(&filter.column);
    let text = text_of(&filter.column);
    let escape = escape_clause();

    let condition = match (filter.operator, &filter.value) {
        (Contains, FilterValue::String(s)) => {
            format!("{text} ILIKE {} {escape}", like_pattern("%", s, "%"))
        }
        (StartsWith, FilterValue::String(s)) => {
            format!("{text} ILIKE {} {escape}", like_pattern("", s, "%"))
        }
        (EndsWith, FilterValue::String(s)) => {
            format!("{text} ILIKE {} {escape}", like_pattern("%", s, ""))
        }
        (Regex, FilterValue::String(s)) => format!("regexp_matches({text}, {})", quote_literal(s)),
        (Equals, FilterValue::String(s)) => format!("{text} = {}", quote_literal(s)),
        (Equals, FilterValue::Number(n)) => format!("{column} = {}", format_number(*n)),
        (Equals, FilterValue::Boolean(b)) => format!("{column} = {b}"),
        (GreaterThan | LessThan | GreaterOrEqual | LessOrEqual, value) => {
            let op = match filter.operator {
                GreaterThan => ">",
                LessThan => "<",
                GreaterOrEqual => ">=",
                _ => "<=",
            };
            let rhs = match value {
                FilterValue::Number(n) => format_number(*n),
                FilterValue::String(s) => quote_literal(s),
                _ => return None,
            };
            format!("{column} {op} {rhs}")
        }
        (Between, FilterValue::DateRange { lo, hi }) => format!(
            "{column} BETWEEN {} AND {}",
            quote_literal(lo),
            quote_literal(hi)
        ),
        (IsEmpty, FilterValue::None) => format!("({column} IS NULL OR {text} = '')"),
        (IsNotEmpty, FilterValue::None) => format!("({column} IS NOT NULL AND {text} <> '')"),
        (IsNull, FilterValue::None) => format!("{column} IS NULL"),
        (IsNotNull, FilterValue::None) => format!("{column} IS NOT NULL"),
        (IsTrue, FilterValue::None) => format!("{column} = true"),
        (IsFalse, FilterValue::None) => format!("{column} = false"),
        _ => return None,
    };

    Some(if filter.negate {
        format!("NOT ({condition})")
    } else {
        condition
    })
}

fn search_condition(state: &ViewState, columns: &[ColumnDescriptor], term: &str) -> Option<String> {
    let pattern = like_pattern("%", term, "%");
    let escape = escape_clause();
    let names = user_columns(columns)
        .map(|c| c.name.as_str())
        .chain(state.computed_columns.iter().map(|c| c.name.as_str()));

    let terms: Vec<String> = names
        .map(|name| format!("{} ILIKE {pattern} {escape}", text_of(name)))
        .collect();
    if terms.is_empty() {
        return None;
    }
    Some(format!("({})", terms.join(" OR ")))
}
