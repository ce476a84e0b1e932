//! Statistics queries used by the column profiler and the column summary.
//!
//! Every function takes a `relation` (a quoted table or a parenthesized
//! subquery, usually [`SqlBuilder::filtered_relation`]) and returns a single
//! statement whose result layout is documented on the function.
//!
//! [`SqlBuilder::filtered_relation`]: crate::SqlBuilder::filtered_relation

use tablescope_model::{ColumnDescriptor, DisplayType};

use crate::quote::quote_identifier;

/// One row: `rows`, then `(non_null, distinct)` per column in input order.
pub fn column_stats_query<'a>(
    relation: &str,
    columns: impl IntoIterator<Item = &'a ColumnDescriptor>,
) -> String {
    let mut select = vec!["COUNT(*)".to_string()];
    for column in columns {
        let name = quote_identifier(&column.name);
        select.push(format!("COUNT({name})"));
        select.push(format!("COUNT(DISTINCT {name})"));
    }
    format!("SELECT {} FROM {relation}", select.join(", "))
}

/// One row: `rows, non_null, distinct, min, max, mean, stddev, q1, median, q3`.
///
/// Numeric columns return doubles for the last seven; other columns return
/// `min`/`max` as text and nulls for the moments.
pub fn descriptive_stats_query(relation: &str, column: &str, display_type: DisplayType) -> String {
    let c = quote_identifier(column);
    if display_type.is_numeric() {
        format!(
            "SELECT COUNT(*), COUNT({c}), COUNT(DISTINCT {c}), \
             CAST(MIN({c}) AS DOUBLE), CAST(MAX({c}) AS DOUBLE), CAST(AVG({c}) AS DOUBLE), \
             CAST(STDDEV_SAMP({c}) AS DOUBLE), CAST(QUANTILE_CONT({c}, 0.25) AS DOUBLE), \
             CAST(QUANTILE_CONT({c}, 0.5) AS DOUBLE), CAST(QUANTILE_CONT({c}, 0.75) AS DOUBLE) \
             FROM {relation}"
        )
    } else {
        format!(
            "SELECT COUNT(*), COUNT({c}), COUNT(DISTINCT {c}), \
             CAST(MIN({c}) AS TEXT), CAST(MAX({c}) AS TEXT), \
             NULL, NULL, NULL, NULL, NULL \
             FROM {relation}"
        )
    }
}

/// Rows of `bin, count, lo, hi` for non-null values, `bin` in `0..bins`.
///
/// Bins are equal-width over `[min, max]`; the maximum lands in the last bin.
/// A constant column produces a single row with `bin = 0`.
pub fn histogram_query(relation: &str, column: &str, bins: u32) -> String {
    let c = quote_identifier(column);
    let bins = bins.max(1);
    let last = bins - 1;
    format!(
        "WITH bounds AS (SELECT CAST(MIN({c}) AS DOUBLE) AS lo, CAST(MAX({c}) AS DOUBLE) AS hi \
         FROM {relation} WHERE {c} IS NOT NULL) \
         SELECT LEAST(GREATEST(COALESCE(CAST(FLOOR((CAST({c} AS DOUBLE) - bounds.lo) / \
         NULLIF((bounds.hi - bounds.lo) / {bins}, 0)) AS BIGINT), 0), 0), {last}) AS bin, \
         COUNT(*) AS n, MIN(bounds.lo) AS lo, MIN(bounds.hi) AS hi \
         FROM {relation}, bounds WHERE {c} IS NOT NULL GROUP BY 1 ORDER BY 1"
    )
}

/// Rows of `value (text), count` for non-null values, most frequent first.
///
/// Ties are broken by value so results are stable.
pub fn frequency_query(relation: &str, column: &str, limit: Option<u64>) -> String {
    let c = quote_identifier(column);
    let limit = limit.map(|n| format!(" LIMIT {n}")).unwrap_or_default();
    format!(
        "SELECT CAST({c} AS TEXT) AS value, COUNT(*) AS n FROM {relation} \
         WHERE {c} IS NOT NULL GROUP BY 1 ORDER BY 2 DESC, 1 ASC{limit}"
    )
}

/// One row: `true_count, false_count, null_count`.
pub fn boolean_counts_query(relation: &str, column: &str) -> String {
    let c = quote_identifier(column);
    format!(
        "SELECT COUNT(*) FILTER (WHERE TRY_CAST({c} AS BOOLEAN) = true), \
         COUNT(*) FILTER (WHERE TRY_CAST({c} AS BOOLEAN) = false), \
         COUNT(*) FILTER (WHERE {c} IS NULL) FROM {relation}"
    )
}

/// One row: `rows, non_null, distinct` for a single column.
pub fn cardinality_query(relation: &str, column: &str) -> String {
    let c = quote_identifier(column);
    format!("SELECT COUNT(*), COUNT({c}), COUNT(DISTINCT {c}) FROM {relation}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablescope_model::EngineType;

    #[test]
    fn column_stats_pairs_counts_per_column() {
        let columns = [
            ColumnDescriptor::new("a", EngineType::BigInt, 0),
            ColumnDescriptor::new("b", EngineType::Varchar, 1),
        ];
        assert_eq!(
            column_stats_query("\"data\"", &columns),
            "SELECT COUNT(*), COUNT(\"a\"), COUNT(DISTINCT \"a\"), COUNT(\"b\"), COUNT(DISTINCT \"b\") FROM \"data\""
        );
    }

    #[test]
    fn text_descriptive_stats_skip_moments() {
        let sql = descriptive_stats_query("\"data\"", "b", DisplayType::Text);
        assert!(sql.contains("CAST(MIN(\"b\") AS TEXT)"));
        assert!(!sql.contains("STDDEV_SAMP"));
    }

    #[test]
    fn histogram_clamps_into_last_bin() {
        let sql = histogram_query("\"data\"", "a", 10);
        assert!(sql.contains("/ 10, 0)"));
        assert!(sql.contains(", 9) AS bin"));
        assert!(histogram_query("\"data\"", "a", 0).contains(", 0) AS bin"));
    }

    #[test]
    fn frequency_limit_is_optional() {
        assert!(frequency_query("\"data\"", "b", Some(15)).ends_with("ORDER BY 2 DESC, 1 ASC LIMIT 15"));
        assert!(frequency_query("\"data\"", "b", None).ends_with("ORDER BY 2 DESC, 1 ASC"));
    }
}
