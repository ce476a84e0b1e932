use std::future::Future;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tablescope_model::{
    AggregationSpec, CellValue, Columns, EngineType, LoadOptions, ViewChange, ViewState,
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::budget::MemoryBudget;
use crate::config::{EngineConfig, SessionConfig};
use crate::engine::EngineGateway;
use crate::error::{Operation, Result, SessionError};
use crate::export::SaveTarget;
use crate::profile::{ProfileOutcome, ProfileRequest};
use crate::queue::EngineHandle;
use crate::summary::ColumnSummary;
use crate::transcode::{EncodingRsTranscoder, Transcoder};

use super::actor::{Command, Reply, Resources, SessionActor};
use super::{FetchOutcome, LoadProgress, Mutation, MutationOutcome, SessionEvent, SessionSnapshot};

/// Configures and opens a session over one delimited file.
///
/// Opening starts the engine queue and the session task but reads nothing;
/// call [`SessionHandle::load_preview`] next.
pub struct SessionBuilder {
    path: PathBuf,
    options: LoadOptions,
    config: SessionConfig,
    engine: EngineConfig,
    budget: Option<MemoryBudget>,
    transcoder: Option<Arc<dyn Transcoder>>,
}

impl SessionBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: LoadOptions::default(),
            config: SessionConfig::default(),
            engine: EngineConfig::from_env(),
            budget: None,
            transcoder: None,
        }
    }

    pub fn load_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Defaults to [`MemoryBudget::shared`].
    pub fn budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Defaults to [`EncodingRsTranscoder`].
    pub fn transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the engine and start the session. Must be called within a Tokio
    /// runtime.
    ///
    /// Unless [`EngineConfig::memory_limit_bytes`] pins a fixed limit, the
    /// session joins its [`MemoryBudget`] here, so the engine runs under its
    /// share from the first statement on.
    pub fn open(self) -> Result<SessionHandle> {
        let budget = self.budget.unwrap_or_else(MemoryBudget::shared);
        let mut engine = self.engine;
        let join_budget = engine.memory_limit_bytes.is_none();
        if join_budget {
            engine.memory_limit_bytes = Some(budget.share_with_one_more());
        }

        let gateway =
            EngineGateway::open(&engine).map_err(|err| err.during(Operation::OpeningFile))?;
        let resources = Resources {
            engine: EngineHandle::spawn(gateway)?,
            budget,
            transcoder: self
                .transcoder
                .unwrap_or_else(|| Arc::new(EncodingRsTranscoder)),
            config: self.config.normalized(),
        };
        let mut actor = SessionActor::new(resources, self.path, self.options);
        if join_budget {
            actor.join_budget();
        }
        Ok(SessionHandle::spawn(actor))
    }
}

/// Cloneable handle to a running session.
///
/// Every method enqueues its command immediately and returns a future for the
/// reply, so commands issued back to back are applied in call order even when
/// their futures are awaited later (or never). Once every handle is dropped
/// the session tears itself down as if [`close`](Self::close) had been called.
#[derive(Clone)]
pub struct SessionHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle").field("id", &self.id).finish()
    }
}

impl SessionHandle {
    pub fn builder(path: impl Into<PathBuf>) -> SessionBuilder {
        SessionBuilder::new(path)
    }

    pub(super) fn spawn(actor: SessionActor) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let handle = Self {
            id: actor.id(),
            commands,
            events: actor.events(),
        };
        tokio::spawn(actor.run(inbox));
        handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Send a command carrying a plain reply channel.
    fn ask<T: Send + 'static>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> impl Future<Output = Result<T>> + Send + 'static {
        let (reply, response) = oneshot::channel();
        let sent = self.commands.send(command(reply)).is_ok();
        async move {
            if !sent {
                return Err(SessionError::Closed);
            }
            response.await.map_err(|_| SessionError::Closed)
        }
    }

    /// Send a command whose reply is itself a `Result`.
    fn call<T: Send + 'static>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> impl Future<Output = Result<T>> + Send + 'static {
        let response = self.ask(command);
        async move { response.await? }
    }

    pub fn snapshot(&self) -> impl Future<Output = Result<SessionSnapshot>> + Send + 'static {
        self.ask(Command::Snapshot)
    }

    /// Read the first rows into a preview table; returns the detected columns.
    pub fn load_preview(&self) -> impl Future<Output = Result<Columns>> + Send + 'static {
        self.call(Command::LoadPreview)
    }

    /// Materialize the whole file; returns the row count.
    pub fn load_full(
        &self,
        progress: Option<mpsc::UnboundedSender<LoadProgress>>,
    ) -> impl Future<Output = Result<u64>> + Send + 'static {
        self.call(move |reply| Command::LoadFull { progress, reply })
    }

    pub fn fetch_page(
        &self,
        index: u64,
    ) -> impl Future<Output = Result<FetchOutcome>> + Send + 'static {
        self.call(move |reply| Command::FetchPage { index, reply })
    }

    /// A cached cell of the current view; `None` when its page is not loaded.
    pub fn cell_value(
        &self,
        row: u64,
        column: impl Into<String>,
    ) -> impl Future<Output = Result<Option<CellValue>>> + Send + 'static {
        let column = column.into();
        self.ask(move |reply| Command::Cell { row, column, reply })
    }

    /// Cached rows of the current view, `None` for rows not loaded.
    pub fn rows(
        &self,
        rows: Range<u64>,
    ) -> impl Future<Output = Result<Vec<Option<Vec<CellValue>>>>> + Send + 'static {
        self.ask(move |reply| Command::Rows { rows, reply })
    }

    /// Replace the view state. Resolves once the filtered row count is
    /// current.
    pub fn update_view_state(
        &self,
        state: ViewState,
    ) -> impl Future<Output = Result<ViewChange>> + Send + 'static {
        self.call(move |reply| Command::UpdateView { state, reply })
    }

    pub fn mutate(
        &self,
        mutation: Mutation,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.call(move |reply| Command::Mutate { mutation, reply })
    }

    pub fn add_column(
        &self,
        name: impl Into<String>,
        engine_type: EngineType,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::AddColumn {
            name: name.into(),
            engine_type,
        })
    }

    pub fn rename_column(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::RenameColumn {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn change_column_type(
        &self,
        column: impl Into<String>,
        engine_type: EngineType,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::ChangeColumnType {
            column: column.into(),
            engine_type,
        })
    }

    pub fn delete_column(
        &self,
        column: impl Into<String>,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::DeleteColumn {
            column: column.into(),
        })
    }

    /// Append a blank row; the outcome carries its identity value.
    pub fn add_row(&self) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::AddRow)
    }

    /// Delete display rows of the current view. Their pages must be loaded.
    pub fn delete_rows(
        &self,
        rows: Vec<u64>,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::DeleteRows { rows })
    }

    pub fn update_cell(
        &self,
        row: u64,
        column: impl Into<String>,
        value: CellValue,
    ) -> impl Future<Output = Result<MutationOutcome>> + Send + 'static {
        self.mutate(Mutation::UpdateCell {
            row,
            column: column.into(),
            value,
        })
    }

    /// Write back to the source file in its original dialect.
    pub fn save(&self) -> impl Future<Output = Result<PathBuf>> + Send + 'static {
        self.call(move |reply| Command::Save {
            target: None,
            reply,
        })
    }

    /// Write to `target`; the session's source becomes `target`.
    pub fn save_as(
        &self,
        target: SaveTarget,
    ) -> impl Future<Output = Result<PathBuf>> + Send + 'static {
        self.call(move |reply| Command::Save {
            target: Some(target),
            reply,
        })
    }

    pub fn profile(
        &self,
        request: ProfileRequest,
    ) -> impl Future<Output = Result<ProfileOutcome>> + Send + 'static {
        self.call(move |reply| Command::Profile { request, reply })
    }

    /// Header summaries from the most recent summary run, waiting for it if
    /// it is still in progress.
    pub fn column_summaries(
        &self,
    ) -> impl Future<Output = Result<Vec<ColumnSummary>>> + Send + 'static {
        self.call(Command::ColumnSummaries)
    }

    /// Evaluate `expression` over the first `limit` rows of the view without
    /// changing anything.
    pub fn preview_expression(
        &self,
        expression: impl Into<String>,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<CellValue>>> + Send + 'static {
        let expression = expression.into();
        self.call(move |reply| Command::PreviewExpression {
            expression,
            limit,
            reply,
        })
    }

    /// Re-read the source with different options. The view is reset.
    pub fn reload(
        &self,
        options: LoadOptions,
    ) -> impl Future<Output = Result<u64>> + Send + 'static {
        self.call(move |reply| Command::Reload { options, reply })
    }

    /// Group the filtered view into a new session sharing this engine.
    pub fn aggregate(
        &self,
        spec: AggregationSpec,
    ) -> impl Future<Output = Result<SessionHandle>> + Send + 'static {
        self.call(move |reply| Command::Aggregate { spec, reply })
    }

    /// Release the memory share, drop owned tables and stop the session.
    pub fn close(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        self.call(Command::Close)
    }
}
