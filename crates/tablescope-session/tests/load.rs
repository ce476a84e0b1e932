mod common;

use common::{fetch, numbered_csv, open, open_loaded, Fixture};
use pretty_assertions::assert_eq;
use tablescope_model::{CellValue, EngineType, ROW_ID_COLUMN};
use tablescope_session::{
    FetchOutcome, LoadProgress, MemoryBudget, Phase, SessionError, SessionEvent, SessionHandle,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn preview_then_full_load_pages_rows() {
    let fixture = Fixture::new(numbered_csv(10));
    let session = open(&fixture);

    let columns = session.load_preview().await.expect("preview");
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(columns[0].engine_type, EngineType::BigInt);

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::PreviewLoaded);
    assert_eq!(snapshot.total_rows, 10);
    assert_eq!(snapshot.cached_pages, vec![0]);
    assert_eq!(
        session.cell_value(2, "b").await.unwrap(),
        Some(CellValue::String("row3".into()))
    );

    let (progress, mut milestones) = mpsc::unbounded_channel();
    let rows = session.load_full(Some(progress)).await.expect("full load");
    assert_eq!(rows, 10);

    let mut seen = Vec::new();
    while let Ok(milestone) = milestones.try_recv() {
        seen.push(milestone);
    }
    assert_eq!(
        seen,
        vec![
            LoadProgress::Started,
            LoadProgress::Reading,
            LoadProgress::Materialized { rows: 10 },
            LoadProgress::Finished { rows: 10 },
        ]
    );

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::FullyLoaded);
    assert!(!snapshot.modified);
    assert!(snapshot.cached_pages.is_empty(), "full load invalidates the preview pages");

    let page = fetch(&session, 0).await;
    assert_eq!(&*page.column_names, &[ROW_ID_COLUMN, "a", "b"]);
    assert_eq!(page.row_range(), 0..10);
    assert_eq!(
        page.rows[0],
        vec![
            CellValue::Integer(1),
            CellValue::Integer(1),
            CellValue::String("row1".into())
        ]
    );
    assert_eq!(page.rows[9][0], CellValue::Integer(10));

    // A page past the end is simply empty.
    assert!(fetch(&session, 3).await.is_empty());
}

#[tokio::test]
async fn missing_file_is_reported() {
    let fixture = Fixture::new("a\n1\n");
    let session = tablescope_session::SessionHandle::builder(fixture.sibling("absent.csv"))
        .engine_config(fixture.engine_config())
        .open()
        .unwrap();

    let err = session.load_preview().await.expect_err("missing file");
    assert!(matches!(err.root(), SessionError::FileNotFound(path) if path.ends_with("absent.csv")));
    assert_eq!(session.snapshot().await.unwrap().phase, Phase::Empty);
}

#[tokio::test]
async fn full_load_requires_a_preview() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open(&fixture);
    let err = session.load_full(None).await.expect_err("no preview yet");
    assert!(matches!(err.root(), SessionError::NotLoaded));
}

#[tokio::test]
async fn quoted_empty_and_missing_fields_stay_distinct() {
    let fixture = Fixture::new("name,note\nZoë,\"\"\nBob,\n");
    let session = open_loaded(&fixture).await;

    let page = fetch(&session, 0).await;
    assert_eq!(common::column(&page, "note"), vec![CellValue::String(String::new()), CellValue::Null]);
    assert_eq!(common::column(&page, "name")[0], CellValue::String("Zoë".into()));
}

#[tokio::test]
async fn non_utf8_sources_are_staged() {
    let fixture = Fixture::new(b"city,n\nZ\xFCrich,1\nMalm\xF6,2\n");
    let session = tablescope_session::SessionHandle::builder(&fixture.path)
        .load_options(tablescope_model::LoadOptions::default().with_encoding("windows-1252"))
        .engine_config(fixture.engine_config())
        .open()
        .unwrap();
    session.load_preview().await.expect("preview");
    session.load_full(None).await.expect("full load");

    let page = fetch(&session, 0).await;
    assert_eq!(
        common::column(&page, "city"),
        vec![
            CellValue::String("Zürich".into()),
            CellValue::String("Malmö".into())
        ]
    );
}

#[tokio::test]
async fn events_follow_the_load() {
    let fixture = Fixture::new(numbered_csv(4));
    let session = open(&fixture);
    let mut events = session.subscribe();

    session.load_preview().await.unwrap();
    session.load_full(None).await.unwrap();

    let mut phases = Vec::new();
    let mut counts = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::PhaseChanged { phase } => phases.push(phase),
            SessionEvent::RowCountChanged { filtered_rows, .. } => counts.push(filtered_rows),
            _ => {}
        }
    }
    assert_eq!(phases, vec![Phase::PreviewLoaded, Phase::FullyLoaded]);
    assert_eq!(counts.last(), Some(&4));
}

#[tokio::test]
async fn reload_applies_new_options_and_resets_the_view() {
    let fixture = Fixture::new("x;y\n1;2\n3;4\n");
    let session = open_loaded(&fixture).await;
    session
        .update_view_state(
            tablescope_model::ViewState::new()
                .with_sort(vec![tablescope_model::SortColumn::descending("x")]),
        )
        .await
        .unwrap();

    let options = tablescope_model::LoadOptions::default()
        .with_header(false)
        .with_delimiter(Some(';'));
    let rows = session.reload(options.clone()).await.expect("reload");
    assert_eq!(rows, 3, "the header line becomes a data row");

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.phase, Phase::FullyLoaded);
    assert_eq!(snapshot.load_options, Some(options));
    assert!(snapshot.view.sort_columns.is_empty());
    assert_eq!(snapshot.filtered_rows(), 3);
    assert_eq!(snapshot.columns.len(), 3);
}

#[tokio::test]
async fn close_stops_the_session() {
    let fixture = Fixture::new(numbered_csv(2));
    let session = open_loaded(&fixture).await;
    let other = session.clone();

    session.close().await.expect("close");
    assert!(matches!(other.snapshot().await, Err(SessionError::Closed)));
    assert!(matches!(other.fetch_page(0).await, Err(SessionError::Closed)));
}

#[tokio::test]
async fn request_futures_outlive_the_handle_borrow() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open_loaded(&fixture).await;

    let page = tokio::spawn(session.fetch_page(0));
    let cell = tokio::spawn(session.cell_value(1, "b"));
    let preview = tokio::spawn(session.preview_expression("a + 1", 2));

    match page.await.expect("page task").expect("fetch page") {
        FetchOutcome::Fetched(page) => assert_eq!(page.len(), 3),
        FetchOutcome::Stale => panic!("first fetch after load is never stale"),
    }
    assert_eq!(
        cell.await.expect("cell task").expect("cell value"),
        Some(CellValue::String("row2".into()))
    );
    assert_eq!(
        preview.await.expect("preview task").expect("preview"),
        vec![CellValue::Integer(2), CellValue::Integer(3)]
    );
}

/// Reads the engine's `memory_limit` setting, reported like `476.8 MiB`.
async fn memory_limit_mib(session: &SessionHandle) -> f64 {
    let values = session
        .preview_expression("current_setting('memory_limit')", 1)
        .await
        .expect("memory limit");
    let text = values[0].as_str().expect("setting is text").to_string();
    let (amount, unit) = text.split_once(' ').expect("amount and unit");
    assert_eq!(unit, "MiB", "{text}");
    amount.parse().expect("numeric amount")
}

#[tokio::test]
async fn sessions_run_under_their_budget_share_from_open() {
    let fixture = Fixture::new(numbered_csv(3));
    let budget = MemoryBudget::new(1_000_000_000);
    let open_shared = || {
        SessionHandle::builder(&fixture.path)
            .engine_config(fixture.engine_config())
            .budget(budget.clone())
            .open()
            .expect("open session")
    };

    let first = open_shared();
    let second = open_shared();
    assert_eq!(budget.members(), 2, "both sessions join before any full load");
    assert_eq!(budget.share(), 500_000_000);

    first.load_preview().await.expect("first preview");
    second.load_preview().await.expect("second preview");
    // 500 MB each.
    assert!((memory_limit_mib(&first).await - 476.8).abs() < 1.0);
    assert!((memory_limit_mib(&second).await - 476.8).abs() < 1.0);

    second.close().await.expect("close");
    assert_eq!(budget.members(), 1);
    // The remaining session grows into the whole 1000 MB.
    assert!((memory_limit_mib(&first).await - 953.6).abs() < 1.0);

    first.close().await.expect("close");
    assert_eq!(budget.members(), 0);
}

#[tokio::test]
async fn fixed_memory_limit_stays_out_of_the_budget() {
    let fixture = Fixture::new(numbered_csv(3));
    let budget = MemoryBudget::new(1_000_000_000);
    let mut engine = fixture.engine_config();
    engine.memory_limit_bytes = Some(200_000_000);
    let session = SessionHandle::builder(&fixture.path)
        .engine_config(engine)
        .budget(budget.clone())
        .open()
        .expect("open session");

    assert_eq!(budget.members(), 0);
    session.load_preview().await.expect("preview");
    // 200 MB.
    assert!((memory_limit_mib(&session).await - 190.7).abs() < 1.0);
}
