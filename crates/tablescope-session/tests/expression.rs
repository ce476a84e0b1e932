mod common;

use common::{fetch, numbered_csv, open, open_loaded, Fixture};
use pretty_assertions::assert_eq;
use tablescope_model::{CellValue, EngineType};
use tablescope_session::SessionError;
use tablescope_sql::ExpressionError;

#[tokio::test]
async fn preview_evaluates_against_the_first_rows() {
    let fixture = Fixture::new(numbered_csv(10));
    let session = open_loaded(&fixture).await;

    let values = session.preview_expression("a * 2", 3).await.expect("preview");
    assert_eq!(
        values,
        vec![CellValue::Integer(2), CellValue::Integer(4), CellValue::Integer(6)]
    );

    let values = session
        .preview_expression("upper(b)", 1)
        .await
        .expect("text preview");
    assert_eq!(values, vec![CellValue::String("ROW1".into())]);
}

#[tokio::test]
async fn statements_cannot_ride_along() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open_loaded(&fixture).await;
    let before = session.snapshot().await.unwrap();

    let err = session
        .preview_expression("a; DROP TABLE data", 3)
        .await
        .expect_err("statement separator");
    assert!(matches!(
        err.root(),
        SessionError::InvalidExpression(ExpressionError::StatementSeparator { .. })
    ));

    let after = session.snapshot().await.unwrap();
    assert_eq!(after.columns, before.columns);
    assert_eq!(after.generation, before.generation);
    assert_eq!(fetch(&session, 0).await.len(), 3);
}

#[tokio::test]
async fn engine_errors_surface_without_touching_the_table() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open_loaded(&fixture).await;

    let err = session
        .preview_expression("no_such_column + 1", 3)
        .await
        .expect_err("binder error");
    assert!(matches!(err.root(), SessionError::Query(_)));
    assert!(!session.snapshot().await.unwrap().modified);
}

#[tokio::test]
async fn failed_preview_leaves_no_transaction_open() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open_loaded(&fixture).await;

    session
        .preview_expression("no_such_column + 1", 3)
        .await
        .expect_err("binder error");

    // A dangling read-only transaction would reject both the next BEGIN and
    // every write.
    let values = session.preview_expression("a * 10", 1).await.expect("preview");
    assert_eq!(values, vec![CellValue::Integer(10)]);
    session
        .add_column("note", EngineType::Varchar)
        .await
        .expect("write after preview");
    let page = fetch(&session, 0).await;
    assert_eq!(page.column_names.last().map(|name| name.as_str()), Some("note"));
}

#[tokio::test]
async fn preview_needs_a_loaded_table() {
    let fixture = Fixture::new(numbered_csv(3));
    let session = open(&fixture);
    let err = session
        .preview_expression("1", 1)
        .await
        .expect_err("nothing loaded");
    assert!(matches!(err.root(), SessionError::NotLoaded));
}
