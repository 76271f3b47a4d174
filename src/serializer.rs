use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::index_set::IndexSet;
use crate::lock::LockFile;
use crate::log::{Log, Sentinels, SortSpec};
use crate::store::Logger;

/// A unit of work submitted to the serializer. Boxed so the worker thread
/// can own a single, uniform job queue regardless of what each job does;
/// every job gets `&mut` access to the engine's state, which is the whole
/// point — there is no mutex because there is exactly one thread that ever
/// touches `Engine`.
type Job = Box<dyn FnOnce(&mut Engine) + Send + 'static>;

/// The serializer's private, single-owner state: the index set, the log
/// backing it, and the advisory lock held for as long as the store is
/// open.
pub struct Engine {
    pub indexes: IndexSet,
    pub log: Log,
    pub logger: Logger,
    _lock: LockFile,
}

enum ToWorker {
    Job(Job),
    Shutdown,
}

/// A FIFO gate around one `Engine`. Every store operation is a closure
/// submitted here and run, in submission order, on a single dedicated
/// worker thread — satisfying the "no operation starts before an earlier
/// one has fully completed" contract without any internal locking.
pub struct Serializer {
    tx: mpsc::Sender<ToWorker>,
    handle: Option<JoinHandle<()>>,
}

impl Serializer {
    /// Spawn the worker thread. It acquires the lock, hydrates the log,
    /// performs one startup compaction, and only then starts pulling jobs
    /// off the queue — so the first `submit`'d job already sees a fully
    /// loaded store.
    pub fn start(path: &Path, primary_field: &str, logger: Logger) -> Result<Self> {
        Self::start_with_sentinels(path, primary_field, logger, Sentinels::default())
    }

    pub fn start_with_sentinels(
        path: &Path,
        primary_field: &str,
        logger: Logger,
        sentinels: Sentinels,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<ToWorker>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let path = path.to_path_buf();
        let primary_field = primary_field.to_string();

        let handle = thread::spawn(move || {
            let mut engine = match bootstrap(&path, &primary_field, logger, sentinels) {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    engine
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            for msg in rx {
                match msg {
                    ToWorker::Job(job) => job(&mut engine),
                    ToWorker::Shutdown => break,
                }
            }
        });

        ready_rx
            .recv()
            .map_err(|_| Error::Corrupt("serializer worker exited during startup".into()))??;

        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }

    /// Run `job` on the worker thread and block until it completes,
    /// returning whatever it produced. A job that panics poisons nothing —
    /// the channel send fails and the caller sees an error instead of a
    /// hang, but the worker thread itself is gone at that point (matching
    /// "a failing job does not corrupt shared state, but does stop the
    /// queue" for the unrecoverable case of a genuine panic).
    pub fn submit<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel::<Result<T>>();
        let boxed: Job = Box::new(move |engine| {
            let result = job(engine);
            let _ = reply_tx.send(result);
        });
        self.tx
            .send(ToWorker::Job(boxed))
            .map_err(|_| Error::Corrupt("serializer worker has shut down".into()))?;
        reply_rx
            .recv()
            .map_err(|_| Error::Corrupt("serializer worker dropped the reply channel".into()))?
    }
}

impl Drop for Serializer {
    fn drop(&mut self) {
        let _ = self.tx.send(ToWorker::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn bootstrap(
    path: &PathBuf,
    primary_field: &str,
    logger: Logger,
    sentinels: Sentinels,
) -> Result<Engine> {
    let lock = LockFile::acquire(path)?;
    logger.emit(&format!("[verbose] acquired lock for {}", path.display()));

    let mut log = Log::open_with_sentinels(path, sentinels)?;
    let indexes = log.hydrate(primary_field)?;
    logger.emit(&format!(
        "[verbose] loaded {} records, {} indexes from {}",
        indexes.len(),
        indexes.descriptors().len(),
        path.display()
    ));

    log.rewrite(&indexes, None)?;
    logger.emit(&format!("[verbose] startup compaction of {}", path.display()));

    Ok(Engine {
        indexes,
        log,
        logger,
        _lock: lock,
    })
}

/// Spawn the auto-compaction timer thread, wired through `submit` so its
/// periodic `Log::rewrite` call is itself just another serialized job —
/// it never touches `Engine` directly. Missed ticks are not coalesced: a
/// tick that fires while the previous compaction is still queued simply
/// queues another. `sort`, if given, is applied to every tick's rewrite;
/// it's shared across ticks via `Arc` since `SortSpec::By` isn't `Clone`.
pub fn spawn_auto_compaction(
    serializer: Arc<Serializer>,
    interval: Duration,
    sort: Option<Arc<SortSpec>>,
) -> (JoinHandle<()>, mpsc::Sender<()>) {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::spawn(move || loop {
        match stop_rx.recv_timeout(interval) {
            Ok(()) => break,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        let sort = sort.clone();
        let _ = serializer.submit(move |engine| {
            engine.logger.emit(&format!(
                "[verbose] auto-compacting {}",
                engine.log.path().display()
            ));
            engine.log.rewrite(&engine.indexes, sort.as_deref())
        });
    });
    (handle, stop_tx)
}
