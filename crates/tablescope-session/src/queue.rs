use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use tokio::sync::oneshot;

use crate::engine::EngineGateway;
use crate::error::{Result, SessionError};

type Job = Box<dyn FnOnce(&mut EngineGateway) + Send>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

struct QueueInner {
    id: u64,
    jobs: mpsc::Sender<Job>,
}

/// Cloneable handle to a strictly serial engine queue.
///
/// Jobs run one at a time, in submission order, on a dedicated thread that
/// owns the [`EngineGateway`]. The thread exits and the connection closes when
/// the last handle is dropped. Sessions derived from another session share
/// its handle, and therefore its connection and ordering.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

impl EngineHandle {
    pub fn spawn(mut engine: EngineGateway) -> Result<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let (jobs, inbox) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("tablescope-engine".to_string())
            .spawn(move || {
                while let Ok(job) = inbox.recv() {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut engine))).is_err() {
                        log::error!("engine queue {id}: job panicked");
                    }
                }
                log::debug!("engine queue {id}: last handle dropped, closing connection");
            })
            .map_err(|err| SessionError::Initialization(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(QueueInner { id, jobs }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of live handles to this queue.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Enqueue `job` and return a future for its result.
    ///
    /// The job is enqueued immediately, not when the future is first polled.
    /// A job that panics, or a queue that is gone, resolves to
    /// [`SessionError::Closed`].
    pub fn submit<T, F>(&self, job: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut EngineGateway) -> Result<T> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let job: Job = Box::new(move |engine| {
            let _ = reply.send(job(engine));
        });
        if self.inner.jobs.send(job).is_err() {
            log::warn!("engine queue {}: submit after shutdown", self.inner.id);
        }
        async move { result.await.unwrap_or(Err(SessionError::Closed)) }
    }

    /// Enqueue `job` without waiting for it.
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce(&mut EngineGateway) + Send + 'static,
    {
        if self.inner.jobs.send(Box::new(job)).is_err() {
            log::warn!("engine queue {}: dispatch after shutdown", self.inner.id);
        }
    }
}
