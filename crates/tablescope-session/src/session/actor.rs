use std::collections::{HashMap, VecDeque};
use std::mem;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tablescope_model::{
    find_column, AggregationSpec, CellValue, ColumnDescriptor, Columns, EngineType, LoadOptions,
    ViewChange, ViewState, ROW_ID_COLUMN,
};
use tablescope_sql::{create_summary_table, preview_statements, SqlBuilder};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::budget::MemoryBudget;
use crate::cache::{Page, PageCache};
use crate::config::SessionConfig;
use crate::engine::QueryResult;
use crate::error::{Operation, Result, SessionError};
use crate::export::{self, SaveTarget};
use crate::profile::{self, Overview, ProfileOutcome, ProfileRequest, ProfileResult};
use crate::queue::EngineHandle;
use crate::summary::{self, ColumnSummary};
use crate::transcode::Transcoder;

use super::handle::SessionHandle;
use super::jobs::{self, Edit, EditApplied, Materialized, PreviewLoad, Source};
use super::{
    FetchOutcome, LoadProgress, Mutation, MutationOutcome, Phase, SessionEvent, SessionSnapshot,
    SessionStats,
};

const EVENT_CAPACITY: usize = 64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SUMMARY_TABLE: AtomicU64 = AtomicU64::new(1);

pub(super) type Reply<T> = oneshot::Sender<Result<T>>;

pub(super) enum Command {
    Snapshot(oneshot::Sender<SessionSnapshot>),
    LoadPreview(Reply<Columns>),
    LoadFull {
        progress: Option<mpsc::UnboundedSender<LoadProgress>>,
        reply: Reply<u64>,
    },
    FetchPage {
        index: u64,
        reply: Reply<FetchOutcome>,
    },
    Cell {
        row: u64,
        column: String,
        reply: oneshot::Sender<Option<CellValue>>,
    },
    Rows {
        rows: Range<u64>,
        reply: oneshot::Sender<Vec<Option<Vec<CellValue>>>>,
    },
    UpdateView {
        state: ViewState,
        reply: Reply<ViewChange>,
    },
    Mutate {
        mutation: Mutation,
        reply: Reply<MutationOutcome>,
    },
    Save {
        target: Option<SaveTarget>,
        reply: Reply<PathBuf>,
    },
    Profile {
        request: ProfileRequest,
        reply: Reply<ProfileOutcome>,
    },
    ColumnSummaries(Reply<Vec<ColumnSummary>>),
    PreviewExpression {
        expression: String,
        limit: u64,
        reply: Reply<Vec<CellValue>>,
    },
    Reload {
        options: LoadOptions,
        reply: Reply<u64>,
    },
    Aggregate {
        spec: AggregationSpec,
        reply: Reply<SessionHandle>,
    },
    Close(Reply<()>),
}

/// Result of an engine job, routed back to the actor.
enum Completion {
    Preview {
        result: Result<PreviewLoad>,
        reply: Reply<Columns>,
    },
    FullLoad {
        result: Result<Materialized>,
        progress: Option<mpsc::UnboundedSender<LoadProgress>>,
        reply: Reply<u64>,
    },
    Page {
        generation: u64,
        index: u64,
        epoch: u64,
        result: Result<QueryResult>,
    },
    Count {
        generation: u64,
        result: Result<u64>,
        waiter: Option<(ViewChange, Reply<ViewChange>)>,
    },
    Edit {
        mutation: Mutation,
        result: Result<EditApplied>,
        reply: Reply<MutationOutcome>,
    },
    Saved {
        target: SaveTarget,
        rebind: bool,
        result: Result<()>,
        reply: Reply<PathBuf>,
    },
    Profile {
        generation: u64,
        result: Result<ProfileResult>,
        reply: Reply<ProfileOutcome>,
    },
    SummaryBase {
        generation: u64,
        result: Result<Overview>,
    },
    SummaryColumn {
        generation: u64,
        result: Result<ColumnSummary>,
    },
    Reloaded {
        result: Result<Materialized>,
        reply: Reply<u64>,
    },
    Aggregated {
        table: String,
        result: Result<Materialized>,
        reply: Reply<SessionHandle>,
    },
}

/// What a session shares with the sessions derived from it.
#[derive(Clone)]
pub(super) struct Resources {
    pub engine: EngineHandle,
    pub budget: MemoryBudget,
    pub transcoder: Arc<dyn Transcoder>,
    pub config: SessionConfig,
}

#[derive(Default)]
struct SummaryRun {
    results: Vec<ColumnSummary>,
    queue: VecDeque<profile::ColumnOverview>,
    running: bool,
    failure: Option<SessionError>,
    waiters: Vec<Reply<Vec<ColumnSummary>>>,
}

pub(super) struct SessionActor {
    id: u64,
    derived: bool,
    resources: Resources,
    events: broadcast::Sender<SessionEvent>,
    budget_held: bool,

    source: Option<Source>,
    phase: Phase,
    modified: bool,
    loading: bool,
    table: String,
    columns: Columns,
    view: ViewState,
    total_rows: u64,
    cache: PageCache,

    generation: u64,
    count_generation: u64,
    profiler_generation: u64,
    summary_generation: u64,
    /// Bumped per page by cell edits; a fetch submitted under an older epoch is stale.
    page_epochs: HashMap<u64, u64>,
    in_flight: HashMap<(u64, u64), Vec<Reply<FetchOutcome>>>,
    summaries: SummaryRun,
    stats: SessionStats,

    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    close_reply: Option<Reply<()>>,
}

impl SessionActor {
    /// A session over a file that has not been read yet.
    pub(super) fn new(resources: Resources, path: PathBuf, options: LoadOptions) -> Self {
        let table = resources.config.table_name.clone();
        Self::with_state(resources, Some(Source::new(path, options)), table, false)
    }

    /// A session over an already materialized table on a shared engine.
    pub(super) fn derived(
        resources: Resources,
        table: String,
        columns: Columns,
        rows: u64,
    ) -> Self {
        let mut actor = Self::with_state(resources, None, table, true);
        actor.phase = Phase::FullyLoaded;
        actor.columns = columns;
        actor.total_rows = rows;
        actor.view.total_filtered_rows = rows;
        actor
    }

    fn with_state(
        resources: Resources,
        source: Option<Source>,
        table: String,
        derived: bool,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cache = PageCache::new(resources.config.page_size, resources.config.max_cached_pages);
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            derived,
            resources,
            events,
            budget_held: false,
            source,
            phase: Phase::Empty,
            modified: false,
            loading: false,
            table,
            columns: Vec::<ColumnDescriptor>::new().into(),
            view: ViewState::default(),
            total_rows: 0,
            cache,
            generation: 0,
            count_generation: 0,
            profiler_generation: 0,
            summary_generation: 0,
            page_epochs: HashMap::new(),
            in_flight: HashMap::new(),
            summaries: SummaryRun::default(),
            stats: SessionStats::default(),
            pending: FuturesUnordered::new(),
            close_reply: None,
        }
    }

    /// Take a share of the memory budget for this session's engine.
    pub(super) fn join_budget(&mut self) {
        if !self.budget_held {
            self.resources
                .budget
                .acquire(self.id, self.resources.engine.clone());
            self.budget_held = true;
        }
    }

    pub(super) fn id(&self) -> u64 {
        self.id
    }

    pub(super) fn events(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub(super) async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        log::debug!("session {}: started (table {:?})", self.id, self.table);
        if self.phase == Phase::FullyLoaded {
            self.start_summaries();
        }

        loop {
            tokio::select! {
                biased;
                command = inbox.recv() => match command {
                    Some(Command::Close(reply)) => {
                        self.close_reply = Some(reply);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_completion(completion);
                }
            }
        }

        self.shutdown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::LoadPreview(reply) => self.load_preview(reply),
            Command::LoadFull { progress, reply } => self.load_full(progress, reply),
            Command::FetchPage { index, reply } => self.fetch_page(index, reply),
            Command::Cell { row, column, reply } => {
                let _ = reply.send(self.cache.value(row, &column).cloned());
            }
            Command::Rows { rows, reply } => {
                let rows: Vec<Option<Vec<CellValue>>> = rows
                    .map(|row| self.cache.row(row).map(<[CellValue]>::to_vec))
                    .collect();
                let _ = reply.send(rows);
            }
            Command::UpdateView { state, reply } => self.update_view(state, reply),
            Command::Mutate { mutation, reply } => self.mutate(mutation, reply),
            Command::Save { target, reply } => self.save(target, reply),
            Command::Profile { request, reply } => self.profile(request, reply),
            Command::ColumnSummaries(reply) => self.column_summaries(reply),
            Command::PreviewExpression {
                expression,
                limit,
                reply,
            } => self.preview_expression(&expression, limit, reply),
            Command::Reload { options, reply } => self.reload(options, reply),
            Command::Aggregate { spec, reply } => self.aggregate(&spec, reply),
            // Handled by the run loop.
            Command::Close(_) => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Preview { result, reply } => self.on_preview(result, reply),
            Completion::FullLoad {
                result,
                progress,
                reply,
            } => self.on_full_load(result, progress, reply),
            Completion::Page {
                generation,
                index,
                epoch,
                result,
            } => self.on_page(generation, index, epoch, result),
            Completion::Count {
                generation,
                result,
                waiter,
            } => self.on_count(generation, result, waiter),
            Completion::Edit {
                mutation,
                result,
                reply,
            } => self.on_edit(mutation, result, reply),
            Completion::Saved {
                target,
                rebind,
                result,
                reply,
            } => self.on_saved(target, rebind, result, reply),
            Completion::Profile {
                generation,
                result,
                reply,
            } => self.on_profile(generation, result, reply),
            Completion::SummaryBase { generation, result } => self.on_summary_base(generation, result),
            Completion::SummaryColumn { generation, result } => {
                self.on_summary_column(generation, result)
            }
            Completion::Reloaded { result, reply } => self.on_reloaded(result, reply),
            Completion::Aggregated {
                table,
                result,
                reply,
            } => self.on_aggregated(table, result, reply),
        }
    }

    fn push<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = Completion> + Send + 'static,
    {
        self.pending.push(future.boxed());
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            log::debug!("session {}: {:?} -> {:?}", self.id, self.phase, phase);
            self.phase = phase;
            self.emit(SessionEvent::PhaseChanged { phase });
        }
    }

    fn set_modified(&mut self, modified: bool) {
        if self.modified != modified {
            self.modified = modified;
            self.emit(SessionEvent::ModifiedChanged { modified });
        }
    }

    fn set_columns(&mut self, columns: Columns) {
        if *self.columns != *columns {
            self.columns = columns.clone();
            self.emit(SessionEvent::SchemaChanged { columns });
        }
    }

    fn emit_row_count(&self) {
        self.emit(SessionEvent::RowCountChanged {
            total_rows: self.total_rows,
            filtered_rows: self.view.total_filtered_rows,
        });
    }

    /// Drop every cached page and supersede in-flight fetches.
    fn bump_generation(&mut self) {
        self.generation += 1;
        self.cache.invalidate_all();
        self.page_epochs.clear();
        self.emit(SessionEvent::RowsInvalidated { pages: None });
    }

    fn page_epoch(&self, index: u64) -> u64 {
        self.page_epochs.get(&index).copied().unwrap_or(0)
    }

    /// Query builder over whichever table currently backs the view.
    fn builder(&self) -> SqlBuilder {
        match self.phase {
            Phase::PreviewLoaded => SqlBuilder::new(self.resources.config.preview_table_name.clone()),
            _ => SqlBuilder::new(self.table.clone()),
        }
    }

    /// Table columns plus the view's computed columns.
    fn view_columns(&self) -> Vec<ColumnDescriptor> {
        let mut columns = self.columns.to_vec();
        for computed in &self.view.computed_columns {
            let ordinal = columns.len();
            columns.push(ColumnDescriptor::new(
                computed.name.clone(),
                EngineType::Other("COMPUTED".to_string()),
                ordinal,
            ));
        }
        columns
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            phase: self.phase,
            modified: self.modified,
            derived: self.derived,
            source: self.source.as_ref().map(|s| s.path.clone()),
            load_options: self.source.as_ref().map(|s| s.options.clone()),
            table: self.table.clone(),
            columns: self.columns.clone(),
            view: self.view.clone(),
            total_rows: self.total_rows,
            generation: self.generation,
            profiler_generation: self.profiler_generation,
            summary_generation: self.summary_generation,
            cached_pages: self.cache.cached_page_indices(),
            cache: self.cache.stats(),
            stats: self.stats,
        }
    }

    // --- loading -----------------------------------------------------------

    fn load_preview(&mut self, reply: Reply<Columns>) {
        let Some(source) = self.source.clone() else {
            let _ = reply.send(Err(SessionError::NotLoaded.during(Operation::OpeningFile)));
            return;
        };
        if self.phase != Phase::Empty || self.loading {
            let _ = reply.send(Err(
                SessionError::Load("file is already open".into()).during(Operation::OpeningFile)
            ));
            return;
        }
        if !source.path.exists() {
            let _ = reply.send(Err(
                SessionError::FileNotFound(source.path).during(Operation::OpeningFile)
            ));
            return;
        }

        self.loading = true;
        let table = self.resources.config.preview_table_name.clone();
        let limit = self.resources.config.preview_rows;
        let transcoder = self.resources.transcoder.clone();
        let job = self.resources.engine.submit(move |engine| {
            jobs::load_preview(engine, source, transcoder.as_ref(), &table, limit)
        });
        self.push(job.map(|result| Completion::Preview { result, reply }));
    }

    fn on_preview(&mut self, result: Result<PreviewLoad>, reply: Reply<Columns>) {
        self.loading = false;
        let preview = match result {
            Ok(preview) => preview,
            Err(err) => {
                log::warn!("session {}: preview failed: {err}", self.id);
                let _ = reply.send(Err(err.during(Operation::OpeningFile)));
                return;
            }
        };

        self.source = Some(preview.source);
        self.total_rows = preview.rows.row_count() as u64;
        self.view.total_filtered_rows = self.total_rows;
        self.set_columns(preview.columns.clone());
        self.set_phase(Phase::PreviewLoaded);

        let names: Arc<[String]> = preview.rows.columns.into();
        let mut loaded = Vec::new();
        for (range, rows) in jobs::paginate(preview.rows.rows, self.cache.page_size()) {
            let index = self.cache.page_index(range.start);
            self.cache.insert_page(Page::new(range.start, names.clone(), rows));
            loaded.push(index);
        }
        self.emit_row_count();
        self.emit(SessionEvent::PagesLoaded { pages: loaded });
        let _ = reply.send(Ok(preview.columns));
    }

    fn load_full(
        &mut self,
        progress: Option<mpsc::UnboundedSender<LoadProgress>>,
        reply: Reply<u64>,
    ) {
        let source = match (&self.source, self.phase) {
            (Some(source), Phase::PreviewLoaded) if !self.loading => source.clone(),
            _ => {
                let _ = reply.send(Err(SessionError::NotLoaded.during(Operation::LoadingFile)));
                return;
            }
        };
        if let Some(progress) = &progress {
            let _ = progress.send(LoadProgress::Started);
        }

        self.loading = true;
        let table = self.table.clone();
        let transcoder = self.resources.transcoder.clone();
        let milestones = progress.clone();
        let clone = self.resources.engine.submit(|engine| engine.try_clone());
        let job = async move {
            let engine = clone.await?;
            tokio::task::spawn_blocking(move || {
                jobs::materialize(&engine, source, transcoder.as_ref(), &table, milestones.as_ref())
            })
            .await
            .map_err(|err| SessionError::Load(err.to_string()))?
        };
        self.push(job.map(|result| Completion::FullLoad {
            result,
            progress,
            reply,
        }));
    }

    fn on_full_load(
        &mut self,
        result: Result<Materialized>,
        progress: Option<mpsc::UnboundedSender<LoadProgress>>,
        reply: Reply<u64>,
    ) {
        self.loading = false;
        let report = |milestone: LoadProgress| {
            if let Some(progress) = &progress {
                let _ = progress.send(milestone);
            }
        };
        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!("session {}: full load failed: {err}", self.id);
                report(LoadProgress::Failed {
                    message: err.to_string(),
                });
                let _ = reply.send(Err(err.during(Operation::LoadingFile)));
                return;
            }
        };

        if let Some(source) = loaded.source {
            self.source = Some(source);
        }
        self.total_rows = loaded.rows;
        self.set_columns(loaded.columns);
        self.set_phase(Phase::FullyLoaded);
        self.bump_generation();
        self.count_generation += 1;
        self.profiler_generation += 1;

        let preview = self.resources.config.preview_table_name.clone();
        self.resources.engine.dispatch(move |engine| {
            if let Err(err) = jobs::drop_tables(engine, &[preview]) {
                log::warn!("failed to drop preview table: {err}");
            }
        });
        self.view.total_filtered_rows = loaded.rows;
        if self.view.restricts_rows() {
            self.submit_count(None);
        }
        self.emit_row_count();
        self.start_summaries();

        report(LoadProgress::Finished { rows: loaded.rows });
        let _ = reply.send(Ok(loaded.rows));
    }

    fn reload(&mut self, options: LoadOptions, reply: Reply<u64>) {
        let op = Operation::ReloadingFile;
        let mut source = match (&self.source, self.phase) {
            (Some(source), Phase::FullyLoaded) => source.clone(),
            _ => {
                let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
                return;
            }
        };
        if let Err(err) = options.validate() {
            let _ = reply.send(Err(SessionError::from(err).during(op)));
            return;
        }
        if source.options.encoding != options.encoding {
            source.staged = None;
        }
        source.options = options;

        self.set_phase(Phase::Reloading);
        self.bump_generation();
        let table = self.table.clone();
        let transcoder = self.resources.transcoder.clone();
        let job = self.resources.engine.submit(move |engine| {
            jobs::materialize(engine, source, transcoder.as_ref(), &table, None)
        });
        self.push(job.map(|result| Completion::Reloaded { result, reply }));
    }

    fn on_reloaded(&mut self, result: Result<Materialized>, reply: Reply<u64>) {
        let loaded = match result {
            Ok(loaded) => loaded,
            Err(err) => {
                log::warn!("session {}: reload failed: {err}", self.id);
                self.set_phase(Phase::FullyLoaded);
                let _ = reply.send(Err(err.during(Operation::ReloadingFile)));
                return;
            }
        };

        self.source = loaded.source;
        self.total_rows = loaded.rows;
        self.view = ViewState::default().with_total_filtered_rows(loaded.rows);
        self.set_columns(loaded.columns);
        self.bump_generation();
        self.count_generation += 1;
        self.profiler_generation += 1;
        self.set_modified(false);
        self.set_phase(Phase::FullyLoaded);
        self.emit_row_count();
        self.start_summaries();
        let _ = reply.send(Ok(loaded.rows));
    }

    // --- paging ------------------------------------------------------------

    fn fetch_page(&mut self, index: u64, reply: Reply<FetchOutcome>) {
        match self.phase {
            Phase::Empty => {
                let _ = reply.send(Err(SessionError::NotLoaded));
                return;
            }
            Phase::Reloading => {
                let _ = reply.send(Ok(FetchOutcome::Stale));
                return;
            }
            Phase::PreviewLoaded | Phase::FullyLoaded => {}
        }
        if let Some(page) = self.cache.page(index) {
            let _ = reply.send(Ok(FetchOutcome::Fetched(page.clone())));
            return;
        }

        let key = (self.generation, index);
        if let Some(waiters) = self.in_flight.get_mut(&key) {
            waiters.push(reply);
            return;
        }
        let sql = match self
            .builder()
            .page_query(&self.view, &self.columns, self.cache.page_range(index))
        {
            Ok(sql) => sql,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };

        let generation = self.generation;
        let epoch = self.page_epoch(index);
        self.in_flight.insert(key, vec![reply]);
        self.stats.page_queries += 1;
        let job = self.resources.engine.submit(move |engine| engine.query(&sql));
        self.push(job.map(move |result| Completion::Page {
            generation,
            index,
            epoch,
            result,
        }));
    }

    fn on_page(&mut self, generation: u64, index: u64, epoch: u64, result: Result<QueryResult>) {
        let waiters = self
            .in_flight
            .remove(&(generation, index))
            .unwrap_or_default();

        let outcome = if generation != self.generation || epoch != self.page_epoch(index) {
            self.stats.stale_results += 1;
            log::debug!(
                "session {}: discarding page {index} from generation {generation}",
                self.id
            );
            Ok(FetchOutcome::Stale)
        } else {
            match result {
                Ok(result) => {
                    let page = Page::from_result(self.cache.page_range(index).start, result);
                    self.cache.insert_page(page.clone());
                    self.emit(SessionEvent::PagesLoaded { pages: vec![index] });
                    Ok(FetchOutcome::Fetched(page))
                }
                Err(err) => Err(err),
            }
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    // --- view state --------------------------------------------------------

    fn update_view(&mut self, state: ViewState, reply: Reply<ViewChange>) {
        if let Err(err) = self.builder().source(&state) {
            let _ = reply.send(Err(err.into()));
            return;
        }

        let change = self.view.diff(&state);
        let filtered = self.view.total_filtered_rows;
        self.view = state.with_total_filtered_rows(filtered);

        if change.selection || change.filters || change.search || change.computed_columns {
            self.profiler_generation += 1;
        }
        if change.invalidates_pages() {
            self.bump_generation();
        }
        if change.requires_count() {
            self.count_generation += 1;
            if self.phase != Phase::Empty {
                self.submit_count(Some((change, reply)));
                return;
            }
        }
        let _ = reply.send(Ok(change));
    }

    fn submit_count(&mut self, waiter: Option<(ViewChange, Reply<ViewChange>)>) {
        let sql = match self.builder().count_query(&self.view, &self.columns) {
            Ok(sql) => sql,
            Err(err) => {
                if let Some((_, reply)) = waiter {
                    let _ = reply.send(Err(err.into()));
                }
                return;
            }
        };
        let generation = self.count_generation;
        self.stats.count_queries += 1;
        let job = self
            .resources
            .engine
            .submit(move |engine| engine.query_count(&sql));
        self.push(job.map(move |result| Completion::Count {
            generation,
            result,
            waiter,
        }));
    }

    fn on_count(
        &mut self,
        generation: u64,
        result: Result<u64>,
        waiter: Option<(ViewChange, Reply<ViewChange>)>,
    ) {
        if generation != self.count_generation {
            self.stats.stale_results += 1;
        } else {
            match result {
                Ok(rows) => {
                    self.view.total_filtered_rows = rows;
                    self.emit_row_count();
                }
                Err(err) => log::warn!(
                    "session {}: row count failed, keeping {}: {err}",
                    self.id,
                    self.view.total_filtered_rows
                ),
            }
        }
        if let Some((change, reply)) = waiter {
            let _ = reply.send(Ok(change));
        }
    }

    // --- mutations ---------------------------------------------------------

    fn mutate(&mut self, mutation: Mutation, reply: Reply<MutationOutcome>) {
        let op = mutation.operation();
        if self.phase != Phase::FullyLoaded {
            let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
            return;
        }
        let edit = match self.resolve(&mutation) {
            Ok(edit) => edit,
            Err(err) => {
                let _ = reply.send(Err(err.during(op)));
                return;
            }
        };
        let table = self.table.clone();
        let job = self
            .resources
            .engine
            .submit(move |engine| jobs::apply_edit(engine, &table, &edit));
        self.push(job.map(|result| Completion::Edit {
            mutation,
            result,
            reply,
        }));
    }

    fn user_column(&self, name: &str) -> Result<()> {
        match find_column(&self.columns, name) {
            Some(column) if !column.is_internal() => Ok(()),
            _ => Err(SessionError::UnknownColumn(name.to_string())),
        }
    }

    fn new_column_name(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() || name == ROW_ID_COLUMN {
            return Err(SessionError::Query(format!("invalid column name {name:?}")));
        }
        if find_column(&self.columns, name).is_some() {
            return Err(SessionError::Query(format!("column {name:?} already exists")));
        }
        Ok(())
    }

    /// Identity value of a display row, read from the cache.
    fn row_id(&mut self, row: u64) -> Result<i64> {
        self.cache
            .value(row, ROW_ID_COLUMN)
            .and_then(CellValue::as_i64)
            .ok_or(SessionError::RowNotLoaded(row))
    }

    fn resolve(&mut self, mutation: &Mutation) -> Result<Edit> {
        Ok(match mutation {
            Mutation::AddColumn { name, engine_type } => {
                self.new_column_name(name)?;
                Edit::AddColumn {
                    name: name.clone(),
                    engine_type: engine_type.clone(),
                }
            }
            Mutation::RenameColumn { from, to } => {
                self.user_column(from)?;
                self.new_column_name(to)?;
                Edit::RenameColumn {
                    from: from.clone(),
                    to: to.clone(),
                }
            }
            Mutation::ChangeColumnType {
                column,
                engine_type,
            } => {
                self.user_column(column)?;
                Edit::ChangeColumnType {
                    column: column.clone(),
                    engine_type: engine_type.clone(),
                }
            }
            Mutation::DeleteColumn { column } => {
                self.user_column(column)?;
                Edit::DeleteColumn {
                    column: column.clone(),
                }
            }
            Mutation::AddRow => Edit::AddRow,
            Mutation::DeleteRows { rows } => Edit::DeleteRows {
                row_ids: rows
                    .iter()
                    .map(|&row| self.row_id(row))
                    .collect::<Result<_>>()?,
            },
            Mutation::UpdateCell { row, column, value } => {
                self.user_column(column)?;
                Edit::UpdateCell {
                    row_id: self.row_id(*row)?,
                    column: column.clone(),
                    value: value.clone(),
                }
            }
        })
    }

    fn on_edit(
        &mut self,
        mutation: Mutation,
        result: Result<EditApplied>,
        reply: Reply<MutationOutcome>,
    ) {
        let applied = match result {
            Ok(applied) => applied,
            Err(err) => {
                let _ = reply.send(Err(err.during(mutation.operation())));
                return;
            }
        };
        log::debug!(
            "session {}: applied {:?} ({} rows)",
            self.id,
            mutation.operation(),
            applied.affected
        );

        self.set_columns(applied.columns);
        if mutation.changes_schema() {
            self.apply_schema_change(&mutation);
        } else {
            self.apply_row_change(&mutation, applied.affected);
        }
        self.profiler_generation += 1;
        self.set_modified(true);
        self.start_summaries();

        let _ = reply.send(Ok(MutationOutcome {
            affected_rows: applied.affected,
            row_id: applied.row_id,
        }));
    }

    fn apply_schema_change(&mut self, mutation: &Mutation) {
        let view = mem::take(&mut self.view);
        let mut recount = false;
        self.view = match mutation {
            Mutation::RenameColumn { from, to } => view.with_renamed_column(from, to),
            Mutation::DeleteColumn { column } => {
                let filters = view.filters.clone();
                let view = view.without_column(column);
                recount = view.filters != filters;
                view
            }
            _ => view,
        };
        self.bump_generation();
        if recount {
            self.count_generation += 1;
            self.submit_count(None);
        }
    }

    fn apply_row_change(&mut self, mutation: &Mutation, affected: u64) {
        let restricted = self.view.restricts_rows();
        match mutation {
            Mutation::UpdateCell { row, .. } => {
                let index = self.cache.page_index(*row);
                self.cache.invalidate_page(index);
                *self.page_epochs.entry(index).or_default() += 1;
                self.emit(SessionEvent::RowsInvalidated {
                    pages: Some(vec![index]),
                });
                return;
            }
            Mutation::AddRow => {
                self.total_rows += affected;
                if restricted || !self.view.sort_columns.is_empty() {
                    self.bump_generation();
                } else {
                    // Unsorted and unfiltered: the new row lands at the end.
                    let index = self.cache.page_index(self.view.total_filtered_rows);
                    self.generation += 1;
                    self.cache.invalidate_page(index);
                    self.emit(SessionEvent::RowsInvalidated {
                        pages: Some(vec![index]),
                    });
                    self.view.total_filtered_rows += affected;
                }
            }
            Mutation::DeleteRows { .. } => {
                self.total_rows = self.total_rows.saturating_sub(affected);
                self.bump_generation();
                if !restricted {
                    self.view.total_filtered_rows =
                        self.view.total_filtered_rows.saturating_sub(affected);
                }
            }
            _ => {}
        }

        self.count_generation += 1;
        if restricted {
            self.submit_count(None);
        } else {
            self.emit_row_count();
        }
    }

    // --- export ------------------------------------------------------------

    fn save(&mut self, target: Option<SaveTarget>, reply: Reply<PathBuf>) {
        let op = Operation::SavingFile;
        if self.phase != Phase::FullyLoaded {
            let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
            return;
        }
        let (target, rebind) = match (target, &self.source) {
            (Some(target), _) => (target, true),
            (None, Some(source)) => (
                SaveTarget::from_load_options(&source.path, &source.options),
                false,
            ),
            (None, None) => {
                let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
                return;
            }
        };

        let table = self.table.clone();
        let columns = self.columns.clone();
        let transcoder = self.resources.transcoder.clone();
        let job_target = target.clone();
        let job = self.resources.engine.submit(move |engine| {
            export::export_table(engine, &table, &columns, &job_target, transcoder.as_ref())
        });
        self.push(job.map(move |result| Completion::Saved {
            target,
            rebind,
            result,
            reply,
        }));
    }

    fn on_saved(
        &mut self,
        target: SaveTarget,
        rebind: bool,
        result: Result<()>,
        reply: Reply<PathBuf>,
    ) {
        if let Err(err) = result {
            let _ = reply.send(Err(err.during(Operation::SavingFile)));
            return;
        }
        if rebind {
            self.source = Some(Source::new(target.path.clone(), target.load_options()));
        } else if let Some(source) = &mut self.source {
            // The staging copy no longer matches the file on disk.
            source.staged = None;
        }
        self.set_modified(false);
        let _ = reply.send(Ok(target.path));
    }

    // --- profiling ---------------------------------------------------------

    fn profile(&mut self, request: ProfileRequest, reply: Reply<ProfileOutcome>) {
        let op = Operation::Profiling;
        if self.phase != Phase::FullyLoaded {
            let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
            return;
        }
        let relation = match self.builder().filtered_relation(&self.view, &self.columns) {
            Ok(relation) => relation,
            Err(err) => {
                let _ = reply.send(Err(SessionError::from(err).during(op)));
                return;
            }
        };
        let columns = self.view_columns();
        let config = self.resources.config.clone();
        let generation = self.profiler_generation;
        let job = self.resources.engine.submit(move |engine| {
            profile::run_profile(engine, &relation, &columns, &request, &config)
        });
        self.push(job.map(move |result| Completion::Profile {
            generation,
            result,
            reply,
        }));
    }

    fn on_profile(
        &mut self,
        generation: u64,
        result: Result<ProfileResult>,
        reply: Reply<ProfileOutcome>,
    ) {
        let outcome = if generation != self.profiler_generation {
            self.stats.stale_results += 1;
            if let Err(err) = &result {
                log::debug!("session {}: ignoring stale profiler failure: {err}", self.id);
            }
            Ok(ProfileOutcome::Stale)
        } else {
            result
                .map(ProfileOutcome::Ready)
                .map_err(|err| err.during(Operation::Profiling))
        };
        let _ = reply.send(outcome);
    }

    fn start_summaries(&mut self) {
        self.summary_generation += 1;
        self.summaries.results.clear();
        self.summaries.queue.clear();
        self.summaries.failure = None;
        self.summaries.running = true;

        let generation = self.summary_generation;
        let relation = SqlBuilder::new(self.table.clone()).table_ref();
        let columns = self.columns.clone();
        self.stats.summary_queries += 1;
        let job = self
            .resources
            .engine
            .submit(move |engine| summary::base_stats(engine, &relation, &columns));
        self.push(job.map(move |result| Completion::SummaryBase { generation, result }));
    }

    fn on_summary_base(&mut self, generation: u64, result: Result<Overview>) {
        if generation != self.summary_generation {
            return;
        }
        match result {
            Ok(overview) => {
                self.summaries.queue = overview.columns.into();
                self.launch_next_summary(generation);
            }
            Err(err) => self.finish_summaries(Some(err)),
        }
    }

    fn launch_next_summary(&mut self, generation: u64) {
        if generation != self.summary_generation {
            return;
        }
        let Some(base) = self.summaries.queue.pop_front() else {
            self.finish_summaries(None);
            return;
        };
        self.stats.summary_queries += 1;
        let relation = SqlBuilder::new(self.table.clone()).table_ref();
        let config = self.resources.config.clone();
        let job = self.resources.engine.submit(move |engine| {
            summary::column_summary(engine, &relation, &base, &config)
        });
        self.push(job.map(move |result| Completion::SummaryColumn { generation, result }));
    }

    fn on_summary_column(&mut self, generation: u64, result: Result<ColumnSummary>) {
        if generation != self.summary_generation {
            return;
        }
        match result {
            Ok(summary) => {
                self.summaries.results.push(summary);
                self.launch_next_summary(generation);
            }
            Err(err) => self.finish_summaries(Some(err)),
        }
    }

    fn finish_summaries(&mut self, failure: Option<SessionError>) {
        if let Some(err) = &failure {
            log::warn!("session {}: column summaries failed: {err}", self.id);
        }
        self.summaries.running = false;
        self.summaries.failure = failure;
        let result = self.summary_result();
        for waiter in self.summaries.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn summary_result(&self) -> Result<Vec<ColumnSummary>> {
        match &self.summaries.failure {
            Some(err) => Err(err.clone().during(Operation::Summarizing)),
            None => Ok(self.summaries.results.clone()),
        }
    }

    fn column_summaries(&mut self, reply: Reply<Vec<ColumnSummary>>) {
        if self.summaries.running {
            self.summaries.waiters.push(reply);
        } else if self.phase != Phase::FullyLoaded && self.summary_generation == 0 {
            let _ = reply.send(Err(SessionError::NotLoaded.during(Operation::Summarizing)));
        } else {
            let _ = reply.send(self.summary_result());
        }
    }

    // --- derived work ------------------------------------------------------

    fn preview_expression(&mut self, expression: &str, limit: u64, reply: Reply<Vec<CellValue>>) {
        if self.phase == Phase::Empty {
            let _ = reply.send(Err(
                SessionError::NotLoaded.during(Operation::PreviewingExpression)
            ));
            return;
        }
        let statements = self
            .builder()
            .source(&self.view)
            .and_then(|relation| preview_statements(expression, &relation, limit));
        let statements = match statements {
            Ok(statements) => statements,
            Err(err) => {
                let _ = reply.send(Err(err.into()));
                return;
            }
        };
        let job = self
            .resources
            .engine
            .submit(move |engine| jobs::preview_expression(engine, statements));
        // Nothing in the actor depends on the result.
        tokio::spawn(async move {
            let result = job.await;
            let _ = reply.send(result.map_err(|err| err.during(Operation::PreviewingExpression)));
        });
    }

    fn aggregate(&mut self, spec: &AggregationSpec, reply: Reply<SessionHandle>) {
        let op = Operation::Aggregating;
        if self.phase != Phase::FullyLoaded {
            let _ = reply.send(Err(SessionError::NotLoaded.during(op)));
            return;
        }
        let table = format!(
            "summary_{}",
            NEXT_SUMMARY_TABLE.fetch_add(1, Ordering::Relaxed)
        );
        let sql = self
            .builder()
            .filtered_relation(&self.view, &self.columns)
            .map_err(SessionError::from)
            .and_then(|relation| {
                Ok(create_summary_table(
                    &table,
                    &relation,
                    &self.view_columns(),
                    spec,
                )?)
            });
        let sql = match sql {
            Ok(sql) => sql,
            Err(err) => {
                let _ = reply.send(Err(err.during(op)));
                return;
            }
        };

        let job_table = table.clone();
        let job = self
            .resources
            .engine
            .submit(move |engine| jobs::create_summary_table(engine, &job_table, &sql));
        self.push(job.map(move |result| Completion::Aggregated {
            table,
            result,
            reply,
        }));
    }

    fn on_aggregated(
        &mut self,
        table: String,
        result: Result<Materialized>,
        reply: Reply<SessionHandle>,
    ) {
        match result {
            Ok(summary) => {
                log::info!(
                    "session {}: aggregated into {table:?} ({} rows)",
                    self.id,
                    summary.rows
                );
                let actor = SessionActor::derived(
                    self.resources.clone(),
                    table,
                    summary.columns,
                    summary.rows,
                );
                let _ = reply.send(Ok(SessionHandle::spawn(actor)));
            }
            Err(err) => {
                let _ = reply.send(Err(err.during(Operation::Aggregating)));
            }
        }
    }

    // --- teardown ----------------------------------------------------------

    fn owned_tables(&self) -> Vec<String> {
        if self.derived {
            vec![self.table.clone()]
        } else {
            vec![
                self.resources.config.preview_table_name.clone(),
                self.table.clone(),
            ]
        }
    }

    async fn shutdown(mut self) {
        // Dropping pending work drops its reply senders; those callers see `Closed`.
        self.pending = FuturesUnordered::new();
        self.in_flight.clear();
        self.summaries.waiters.clear();

        if self.budget_held {
            self.resources.budget.release(self.id);
        }
        let tables = self.owned_tables();
        let result = self
            .resources
            .engine
            .submit(move |engine| jobs::drop_tables(engine, &tables))
            .await;
        match &result {
            Ok(()) => log::debug!("session {}: closed", self.id),
            Err(err) => log::warn!("session {}: teardown failed: {err}", self.id),
        }
        if let Some(reply) = self.close_reply.take() {
            let _ = reply.send(result);
        }
    }
}
