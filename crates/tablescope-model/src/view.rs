//! Declarative description of what a session currently displays.
//!
//! A [`ViewState`] is treated as a value: the coordinator replaces it
//! wholesale and never mutates a state another task may be reading. The
//! `with_*` helpers consume and return a new instance.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    pub fn sql_keyword(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortColumn {
    pub column: String,
    pub direction: SortDirection,
}

impl SortColumn {
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: SortDirection::Descending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Contains,
    Equals,
    StartsWith,
    EndsWith,
    Regex,
    IsEmpty,
    IsNotEmpty,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Between,
    IsNull,
    IsNotNull,
    IsTrue,
    IsFalse,
}

impl FilterOperator {
    /// Whether `value` is a variant this operator knows how to render.
    ///
    /// Mismatched combinations are kept but render no condition.
    pub fn accepts(self, value: &FilterValue) -> bool {
        use FilterOperator::*;
        match self {
            Contains | StartsWith | EndsWith | Regex => matches!(value, FilterValue::String(_)),
            Equals => matches!(
                value,
                FilterValue::String(_) | FilterValue::Number(_) | FilterValue::Boolean(_)
            ),
            GreaterThan | LessThan | GreaterOrEqual | LessOrEqual => {
                matches!(value, FilterValue::String(_) | FilterValue::Number(_))
            }
            Between => matches!(value, FilterValue::DateRange { .. }),
            IsEmpty | IsNotEmpty | IsNull | IsNotNull | IsTrue | IsFalse => {
                matches!(value, FilterValue::None)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    String(String),
    Number(f64),
    DateRange { lo: String, hi: String },
    Boolean(bool),
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnFilter {
    pub column: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
    #[serde(default)]
    pub negate: bool,
}

impl ColumnFilter {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: FilterValue) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            negate: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// False when the operator/value combination is invalid and the filter is a no-op.
    pub fn is_effective(&self) -> bool {
        self.operator.accepts(&self.value)
    }
}

/// A user-supplied SQL expression exposed as an extra, never-materialized column.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputedColumn {
    pub name: String,
    pub expression: String,
}

impl ComputedColumn {
    pub fn new(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

/// Rows currently on screen (`start..end`, end exclusive).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VisibleRange {
    pub start: u64,
    pub end: u64,
}

impl VisibleRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    #[serde(default)]
    pub sort_columns: Vec<SortColumn>,
    #[serde(default)]
    pub filters: Vec<ColumnFilter>,
    #[serde(default)]
    pub search_term: Option<String>,
    #[serde(default)]
    pub computed_columns: Vec<ComputedColumn>,
    #[serde(default)]
    pub selected_column: Option<String>,
    #[serde(default)]
    pub total_filtered_rows: u64,
    #[serde(default)]
    pub visible_range: VisibleRange,
}

/// Which query-relevant parts differ between two view states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViewChange {
    pub sort: bool,
    pub filters: bool,
    pub search: bool,
    pub computed_columns: bool,
    pub selection: bool,
    /// Search is active in the *new* state.
    pub search_active: bool,
}

impl ViewChange {
    /// Row ordering, membership or available columns changed.
    pub fn invalidates_pages(&self) -> bool {
        self.sort || self.filters || self.search || self.computed_columns
    }

    /// The filtered row count may differ. Sorting never changes it; computed
    /// columns only matter when the search also matches against them.
    pub fn requires_count(&self) -> bool {
        self.filters || self.search || (self.computed_columns && self.search_active)
    }
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sort(mut self, sort_columns: Vec<SortColumn>) -> Self {
        self.sort_columns = sort_columns;
        self
    }

    pub fn with_filters(mut self, filters: Vec<ColumnFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_filter(mut self, filter: ColumnFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_search(mut self, term: Option<impl Into<String>>) -> Self {
        self.search_term = term.map(Into::into);
        self
    }

    pub fn with_computed_columns(mut self, computed: Vec<ComputedColumn>) -> Self {
        self.computed_columns = computed;
        self
    }

    pub fn with_computed_column(mut self, computed: ComputedColumn) -> Self {
        self.computed_columns.push(computed);
        self
    }

    pub fn with_selected_column(mut self, column: Option<impl Into<String>>) -> Self {
        self.selected_column = column.map(Into::into);
        self
    }

    pub fn with_visible_range(mut self, range: VisibleRange) -> Self {
        self.visible_range = range;
        self
    }

    pub fn with_total_filtered_rows(mut self, rows: u64) -> Self {
        self.total_filtered_rows = rows;
        self
    }

    /// The trimmed search term, or `None` when no search is active.
    pub fn active_search(&self) -> Option<&str> {
        self.search_term
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }

    /// Effective filters plus any search term restrict the row set.
    pub fn restricts_rows(&self) -> bool {
        self.filters.iter().any(ColumnFilter::is_effective) || self.active_search().is_some()
    }

    pub fn diff(&self, next: &ViewState) -> ViewChange {
        ViewChange {
            sort: self.sort_columns != next.sort_columns,
            filters: self.filters != next.filters,
            search: self.active_search() != next.active_search(),
            computed_columns: self.computed_columns != next.computed_columns,
            selection: self.selected_column != next.selected_column,
            search_active: next.active_search().is_some(),
        }
    }

    /// References `column` anywhere in sort, filters or selection.
    pub fn references_column(&self, column: &str) -> bool {
        self.sort_columns.iter().any(|s| s.column == column)
            || self.filters.iter().any(|f| f.column == column)
            || self.selected_column.as_deref() == Some(column)
    }

    /// Drop every reference to a deleted column.
    pub fn without_column(mut self, column: &str) -> Self {
        self.sort_columns.retain(|s| s.column != column);
        self.filters.retain(|f| f.column != column);
        if self.selected_column.as_deref() == Some(column) {
            self.selected_column = None;
        }
        self
    }

    /// Point every reference to `old` at `new`.
    pub fn with_renamed_column(mut self, old: &str, new: &str) -> Self {
        for sort in &mut self.sort_columns {
            if sort.column == old {
                sort.column = new.to_string();
            }
        }
        for filter in &mut self.filters {
            if filter.column == old {
                filter.column = new.to_string();
            }
        }
        if self.selected_column.as_deref() == Some(old) {
            self.selected_column = Some(new.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_a_gt_5() -> ColumnFilter {
        ColumnFilter::new("a", FilterOperator::GreaterThan, FilterValue::Number(5.0))
    }

    #[test]
    fn sort_only_change_does_not_require_count() {
        let base = ViewState::new();
        let next = base.clone().with_sort(vec![SortColumn::descending("b")]);
        let change = base.diff(&next);
        assert!(change.invalidates_pages());
        assert!(!change.requires_count());
    }

    #[test]
    fn filter_change_requires_count() {
        let base = ViewState::new();
        let next = base.clone().with_filter(filter_a_gt_5());
        let change = base.diff(&next);
        assert!(change.invalidates_pages());
        assert!(change.requires_count());
    }

    #[test]
    fn computed_change_requires_count_only_while_searching() {
        let base = ViewState::new();
        let computed = base
            .clone()
            .with_computed_column(ComputedColumn::new("doubled", "a * 2"));
        assert!(!base.diff(&computed).requires_count());

        let searching = base.clone().with_search(Some("4"));
        let searching_computed = searching
            .clone()
            .with_computed_column(ComputedColumn::new("doubled", "a * 2"));
        assert!(searching.diff(&searching_computed).requires_count());
    }

    #[test]
    fn whitespace_search_is_not_active() {
        let base = ViewState::new();
        let blank = base.clone().with_search(Some("   "));
        assert_eq!(blank.active_search(), None);
        assert!(!base.diff(&blank).invalidates_pages());
    }

    #[test]
    fn selection_and_range_do_not_invalidate() {
        let base = ViewState::new();
        let next = base
            .clone()
            .with_selected_column(Some("a"))
            .with_visible_range(VisibleRange::new(10, 40));
        let change = base.diff(&next);
        assert!(!change.invalidates_pages());
        assert!(change.selection);
    }

    #[test]
    fn mismatched_filter_value_is_not_effective() {
        let filter = ColumnFilter::new("a", FilterOperator::IsNull, FilterValue::String("x".into()));
        assert!(!filter.is_effective());
        assert!(!ViewState::new().with_filter(filter).restricts_rows());
        assert!(filter_a_gt_5().is_effective());
    }

    #[test]
    fn rename_and_delete_scrub_references() {
        let state = ViewState::new()
            .with_sort(vec![SortColumn::ascending("a"), SortColumn::ascending("b")])
            .with_filter(filter_a_gt_5())
            .with_selected_column(Some("a"));

        let renamed = state.clone().with_renamed_column("a", "alpha");
        assert_eq!(renamed.sort_columns[0].column, "alpha");
        assert_eq!(renamed.filters[0].column, "alpha");
        assert_eq!(renamed.selected_column.as_deref(), Some("alpha"));
        assert!(!renamed.references_column("a"));

        let deleted = state.without_column("a");
        assert_eq!(deleted.sort_columns, vec![SortColumn::ascending("b")]);
        assert!(deleted.filters.is_empty());
        assert_eq!(deleted.selected_column, None);
    }
}
