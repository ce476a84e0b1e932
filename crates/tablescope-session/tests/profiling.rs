mod common;

use common::{fetch, open, open_loaded, open_loaded_with, Fixture};
use pretty_assertions::assert_eq;
use tablescope_model::{
    CellValue, ColumnFilter, DisplayType, FilterOperator, FilterValue, ViewState,
};
use tablescope_session::{
    Distribution, ProfileOutcome, ProfileRequest, ProfileResult, SessionConfig, SessionError,
    SummaryShape, ValueCount,
};

/// 20 rows: `n` = 1..=20, `kind` alternates even/odd, `flag` is n > 15,
/// `label` is unique per row and null on every fifth row.
fn mixed_csv() -> String {
    let mut csv = String::from("n,kind,flag,label\n");
    for n in 1..=20 {
        let kind = if n % 2 == 0 { "even" } else { "odd" };
        let label = if n % 5 == 0 { String::new() } else { format!("item-{n}") };
        csv.push_str(&format!("{n},{kind},{},{label}\n", n > 15));
    }
    csv
}

fn ready(outcome: tablescope_session::Result<ProfileOutcome>) -> ProfileResult {
    match outcome.expect("profile") {
        ProfileOutcome::Ready(result) => result,
        ProfileOutcome::Stale => panic!("unexpectedly stale"),
    }
}

#[tokio::test]
async fn overview_counts_nulls_and_distinct_values() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;

    let ProfileResult::Overview(overview) = ready(session.profile(ProfileRequest::Overview).await)
    else {
        panic!("expected overview");
    };
    assert_eq!(overview.rows, 20);
    let label = overview.columns.iter().find(|c| c.name == "label").unwrap();
    assert_eq!((label.non_null, label.nulls, label.distinct), (16, 4, 16));
    assert!(overview.columns.iter().all(|c| c.name != tablescope_model::ROW_ID_COLUMN));
}

#[tokio::test]
async fn descriptive_stats_follow_the_filtered_view() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;
    session
        .update_view_state(ViewState::new().with_filter(ColumnFilter::new(
            "kind",
            FilterOperator::Equals,
            FilterValue::String("even".into()),
        )))
        .await
        .unwrap();

    let request = ProfileRequest::Descriptive {
        column: "n".into(),
    };
    let ProfileResult::Descriptive(stats) = ready(session.profile(request).await) else {
        panic!("expected descriptive stats");
    };
    assert_eq!(stats.rows, 10);
    assert_eq!(stats.min, CellValue::Integer(2));
    assert_eq!(stats.max, CellValue::Integer(20));
    assert_eq!(stats.mean, Some(11.0));
}

#[tokio::test]
async fn histogram_and_distribution() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded_with(
        &fixture,
        SessionConfig {
            categorical_threshold: 5,
            ..SessionConfig::default()
        },
    )
    .await;

    let request = ProfileRequest::Histogram {
        column: "n".into(),
        bins: Some(4),
    };
    let ProfileResult::Histogram(histogram) = ready(session.profile(request).await) else {
        panic!("expected histogram");
    };
    assert_eq!(histogram.bins.len(), 4);
    assert_eq!(histogram.total(), 20);

    let request = ProfileRequest::Distribution {
        column: "kind".into(),
    };
    let ProfileResult::Distribution(Distribution::Categorical { values }) =
        ready(session.profile(request).await)
    else {
        panic!("low-cardinality text is categorical");
    };
    assert_eq!(
        values,
        vec![
            ValueCount { value: "even".into(), count: 10 },
            ValueCount { value: "odd".into(), count: 10 },
        ]
    );

    let request = ProfileRequest::Distribution {
        column: "n".into(),
    };
    assert!(matches!(
        ready(session.profile(request).await),
        ProfileResult::Distribution(Distribution::Binned { .. })
    ));

    let request = ProfileRequest::Distribution {
        column: "label".into(),
    };
    assert!(matches!(
        ready(session.profile(request).await),
        ProfileResult::Distribution(Distribution::TopN { distinct: 16, non_null: 16, .. })
    ));
}

#[tokio::test]
async fn results_superseded_by_a_selection_change_are_stale() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;

    let pending = session.profile(ProfileRequest::Descriptive {
        column: "n".into(),
    });
    let selected = session.update_view_state(ViewState::new().with_selected_column(Some("kind")));

    assert_eq!(pending.await.unwrap(), ProfileOutcome::Stale);
    selected.await.unwrap();

    // Failures that arrive stale are not reported either.
    let failing = session.profile(ProfileRequest::Descriptive {
        column: "nope".into(),
    });
    let reselected = session.update_view_state(ViewState::new().with_selected_column(Some("n")));
    assert_eq!(failing.await.unwrap(), ProfileOutcome::Stale);
    reselected.await.unwrap();

    let err = session
        .profile(ProfileRequest::Descriptive {
            column: "nope".into(),
        })
        .await
        .expect_err("unknown column");
    assert!(matches!(err.root(), SessionError::UnknownColumn(name) if name == "nope"));
}

#[tokio::test]
async fn column_summaries_pick_a_shape_per_column() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;

    let summaries = session.column_summaries().await.expect("summaries");
    let shape_of = |name: &str| {
        summaries
            .iter()
            .find(|s| s.column == name)
            .unwrap_or_else(|| panic!("no summary for {name}"))
    };

    assert_eq!(summaries.len(), 4);
    assert!(matches!(shape_of("n").shape, SummaryShape::Histogram { .. }));
    assert!(matches!(&shape_of("kind").shape, SummaryShape::TopValues { values } if values.len() == 2));
    assert_eq!(shape_of("label").shape, SummaryShape::Cardinality);
    assert_eq!(shape_of("label").nulls, 4);
    assert_eq!(shape_of("flag").display_type, DisplayType::Boolean);
    assert!(matches!(
        shape_of("flag").shape,
        SummaryShape::Boolean { counts } if counts.true_count == 5 && counts.false_count == 15
    ));
}

#[tokio::test]
async fn summaries_restart_after_a_mutation() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;
    let first = session.snapshot().await.unwrap().summary_generation;

    session
        .add_column("extra", tablescope_model::EngineType::Varchar)
        .await
        .unwrap();
    let summaries = session.column_summaries().await.unwrap();

    assert!(session.snapshot().await.unwrap().summary_generation > first);
    let extra = summaries.iter().find(|s| s.column == "extra").expect("new column summarized");
    assert_eq!((extra.non_null, extra.nulls), (0, 20));
}

#[tokio::test]
async fn superseded_summary_run_stops_launching_queries() {
    let fixture = Fixture::new(mixed_csv());
    let session = open_loaded(&fixture).await;
    session.column_summaries().await.expect("initial run");
    fetch(&session, 0).await;
    let before = session.snapshot().await.expect("snapshot");
    let per_run = before.stats.summary_queries;
    assert!(per_run > 1, "an overview plus one query per column");

    // Both edits are queued before either completes, so the run started by
    // the first is superseded right after its overview.
    let first = session.update_cell(0, "label", CellValue::String("a".into()));
    let second = session.update_cell(1, "label", CellValue::String("b".into()));
    first.await.expect("first edit");
    second.await.expect("second edit");
    let summaries = session.column_summaries().await.expect("final run");

    let after = session.snapshot().await.expect("snapshot");
    assert_eq!(after.summary_generation, before.summary_generation + 2);
    assert_eq!(after.stats.summary_queries, before.stats.summary_queries + per_run + 1);
    let label = summaries.iter().find(|s| s.column == "label").expect("label summary");
    assert_eq!(label.nulls, 4);
}

#[tokio::test]
async fn profiling_needs_a_loaded_table() {
    let fixture = Fixture::new(mixed_csv());
    let session = open(&fixture);
    let err = session
        .profile(ProfileRequest::Overview)
        .await
        .expect_err("nothing loaded");
    assert!(matches!(err.root(), SessionError::NotLoaded));
    assert!(session.column_summaries().await.is_err());
}
