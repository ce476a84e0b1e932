mod common;

use common::{column, fetch, open_loaded, Fixture};
use pretty_assertions::assert_eq;
use tablescope_model::{CellValue, LoadOptions, ROW_ID_COLUMN};
use tablescope_session::{SaveTarget, SessionHandle, SessionError};

const NOTES: &str = "name,note\nZoë,\"\"\nBob,\n";

#[tokio::test]
async fn utf8_save_round_trips_empty_strings_and_nulls() {
    let fixture = Fixture::new(NOTES);
    let session = open_loaded(&fixture).await;
    let target = fixture.sibling("out.csv");

    let written = session
        .save_as(SaveTarget::new(&target))
        .await
        .expect("save");
    assert_eq!(written, target);

    let text = std::fs::read_to_string(&target).unwrap();
    assert!(!text.contains(ROW_ID_COLUMN), "identity column leaked: {text}");
    assert!(text.contains("\"Zoë\""), "values are force-quoted: {text}");

    let reread = SessionHandle::builder(&target)
        .engine_config(fixture.engine_config())
        .open()
        .unwrap();
    reread.load_preview().await.unwrap();
    reread.load_full(None).await.unwrap();
    let page = fetch(&reread, 0).await;
    assert_eq!(
        column(&page, "note"),
        vec![CellValue::String(String::new()), CellValue::Null]
    );
}

#[tokio::test]
async fn windows_1252_save_keeps_quoted_empty_fields() {
    let fixture = Fixture::new(NOTES);
    let session = open_loaded(&fixture).await;
    let target = fixture.sibling("latin.csv");

    session
        .save_as(
            SaveTarget::new(&target)
                .with_delimiter(';')
                .with_encoding("windows-1252"),
        )
        .await
        .expect("save");

    let bytes = std::fs::read(&target).unwrap();
    assert_eq!(bytes, b"\"name\";\"note\"\n\"Zo\xEB\";\"\"\n\"Bob\";\n".to_vec());

    let snapshot = session.snapshot().await.unwrap();
    assert_eq!(snapshot.source.as_deref(), Some(target.as_path()));
    assert_eq!(
        snapshot.load_options,
        Some(
            LoadOptions::default()
                .with_delimiter(Some(';'))
                .with_encoding("windows-1252")
        )
    );
}

#[tokio::test]
async fn save_writes_edits_back_in_the_original_dialect() {
    let fixture = Fixture::new("id;city\n1;Oslo\n2;Bergen\n");
    let session = SessionHandle::builder(&fixture.path)
        .load_options(LoadOptions::default().with_delimiter(Some(';')))
        .engine_config(fixture.engine_config())
        .open()
        .unwrap();
    session.load_preview().await.unwrap();
    session.load_full(None).await.unwrap();
    fetch(&session, 0).await;

    session
        .update_cell(1, "city", CellValue::String("Trondheim".into()))
        .await
        .unwrap();
    // The edit invalidated page 0; row identities are read from the cache.
    fetch(&session, 0).await;
    session.delete_rows(vec![0]).await.unwrap();
    assert!(session.snapshot().await.unwrap().modified);

    let written = session.save().await.expect("save");
    assert_eq!(written, fixture.path);
    assert!(!session.snapshot().await.unwrap().modified);

    let text = std::fs::read_to_string(&fixture.path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2, "header plus one row: {text}");
    assert!(lines[1].contains("Trondheim") && lines[1].contains(';'));
    assert!(!text.contains("Oslo") && !text.contains(','));
}

#[tokio::test]
async fn save_keeps_rows_in_identity_order_under_a_sort() {
    let fixture = Fixture::new("n\n3\n1\n2\n");
    let session = open_loaded(&fixture).await;
    session
        .update_view_state(
            tablescope_model::ViewState::new()
                .with_sort(vec![tablescope_model::SortColumn::ascending("n")]),
        )
        .await
        .unwrap();
    let target = fixture.sibling("sorted.csv");
    session
        .save_as(SaveTarget::new(&target).with_encoding("windows-1252"))
        .await
        .unwrap();

    assert_eq!(
        std::fs::read(&target).unwrap(),
        b"\"n\"\n\"3\"\n\"1\"\n\"2\"\n".to_vec()
    );
}

#[tokio::test]
async fn every_encoding_writes_the_same_force_quoted_layout() {
    let fixture = Fixture::new("name,code\nx,A7\n,B8\n");
    let session = open_loaded(&fixture).await;
    let utf8 = fixture.sibling("utf8.csv");
    let latin = fixture.sibling("latin.csv");

    session.save_as(SaveTarget::new(&utf8)).await.expect("utf-8 save");
    session
        .save_as(SaveTarget::new(&latin).with_encoding("windows-1252"))
        .await
        .expect("windows-1252 save");

    let latin = std::fs::read_to_string(&latin).unwrap();
    assert_eq!(latin, "\"name\",\"code\"\n\"x\",\"A7\"\n,\"B8\"\n");

    let utf8 = std::fs::read_to_string(&utf8).unwrap();
    let rows = |text: &str| text.lines().skip(1).map(str::to_string).collect::<Vec<_>>();
    assert_eq!(rows(&utf8), rows(&latin));
}

#[tokio::test]
async fn unrepresentable_text_fails_and_leaves_the_target_alone() {
    let fixture = Fixture::new("word\n日本\n");
    let session = open_loaded(&fixture).await;
    let target = fixture.sibling("existing.csv");
    std::fs::write(&target, "keep me").unwrap();

    let err = session
        .save_as(SaveTarget::new(&target).with_encoding("windows-1252"))
        .await
        .expect_err("cannot encode");
    assert!(matches!(err.root(), SessionError::Encoding(_)));
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "keep me");
    assert_eq!(
        session.snapshot().await.unwrap().source.as_deref(),
        Some(fixture.path.as_path())
    );
}
