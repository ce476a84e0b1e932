#![allow(dead_code)]

use std::path::{Path, PathBuf};

use tablescope_session::{
    EngineConfig, FetchOutcome, MemoryBudget, Page, SessionConfig, SessionHandle,
};
use tempfile::TempDir;

/// A CSV file in its own temp directory.
pub struct Fixture {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl Fixture {
    pub fn new(contents: impl AsRef<[u8]>) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("data.csv");
        std::fs::write(&path, contents).expect("write fixture");
        Self { dir, path }
    }

    pub fn sibling(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn engine_config(&self) -> EngineConfig {
        engine_config(self.dir.path())
    }
}

pub fn engine_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        threads: Some(1),
        temp_directory: Some(dir.join("spill")),
        ..EngineConfig::default()
    }
}

/// `a,b` with `a` = 1..=rows and `b` = `row<a>`.
pub fn numbered_csv(rows: u64) -> String {
    let mut csv = String::from("a,b\n");
    for i in 1..=rows {
        csv.push_str(&format!("{i},row{i}\n"));
    }
    csv
}

pub fn open_with(fixture: &Fixture, config: SessionConfig) -> SessionHandle {
    SessionHandle::builder(&fixture.path)
        .config(config)
        .engine_config(fixture.engine_config())
        .budget(MemoryBudget::new(1 << 30))
        .open()
        .expect("open session")
}

pub fn open(fixture: &Fixture) -> SessionHandle {
    open_with(fixture, SessionConfig::default())
}

/// Preview and fully load `fixture`.
pub async fn open_loaded_with(fixture: &Fixture, config: SessionConfig) -> SessionHandle {
    let session = open_with(fixture, config);
    session.load_preview().await.expect("preview");
    session.load_full(None).await.expect("full load");
    session
}

pub async fn open_loaded(fixture: &Fixture) -> SessionHandle {
    open_loaded_with(fixture, SessionConfig::default()).await
}

pub async fn fetch(session: &SessionHandle, index: u64) -> Page {
    match session.fetch_page(index).await.expect("fetch page") {
        FetchOutcome::Fetched(page) => page,
        FetchOutcome::Stale => panic!("page {index} unexpectedly stale"),
    }
}

/// Values of `column` on `page`.
pub fn column(page: &Page, column: &str) -> Vec<tablescope_model::CellValue> {
    let idx = page
        .column_index(column)
        .unwrap_or_else(|| panic!("no column {column:?} in {:?}", page.column_names));
    page.rows.iter().map(|row| row[idx].clone()).collect()
}
