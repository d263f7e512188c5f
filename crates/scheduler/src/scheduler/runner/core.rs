use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use crate::scheduler::error::{SchedulerError, SchedulerResult};
use crate::scheduler::events::{EventKind, SchedulerEvent};
use crate::scheduler::executor::SyncExecutor;
use crate::scheduler::metrics::SchedulerMetrics;
use crate::scheduler::resolver::{CachedResolver, Resolver};
use crate::scheduler::state::{SchedulerState, SharedSchedulerState};
use crate::scheduler::store::{MemoryResultStore, ResultStore};
use crate::scheduler::types::SchedulerConfig;

use super::execution::{Command, Coordinator};
use super::scheduling::Admission;

/// How [`Scheduler::stop`] treats tasks that have not finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Let every dispatched task reach a terminal state first.
    #[default]
    Wait,
    /// Move every non-terminal task to `Cancelled` and return promptly.
    Cancel,
}

/// The task scheduler.
///
/// Accepts tasks by reference, runs blocking ones on a bounded worker pool
/// and suspendable ones on a dedicated coordination thread, and keeps every
/// task's state and outcome queryable until it is evicted.
///
/// The value is an explicit handle; share it with `Arc` when several
/// callers need it.
pub struct Scheduler {
    pub(super) config: SchedulerConfig,
    pub(super) admission: Arc<Admission>,
    pub(super) state: SharedSchedulerState,
    /// Command channel into the coordination loop. `None` while stopped.
    pub(super) commands: RwLock<Option<mpsc::UnboundedSender<Command>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler backed by an in-memory result store.
    pub fn new<R>(config: SchedulerConfig, resolver: R) -> SchedulerResult<Self>
    where
        R: Resolver + 'static,
    {
        Self::with_store(config, resolver, Arc::new(MemoryResultStore::new()))
    }

    /// Create a stopped scheduler writing records through `store`.
    pub fn with_store<R>(
        config: SchedulerConfig,
        resolver: R,
        store: Arc<dyn ResultStore>,
    ) -> SchedulerResult<Self>
    where
        R: Resolver + 'static,
    {
        config.validate()?;
        let state = Arc::new(SchedulerState::new(store, config.event_capacity));
        let resolver: Arc<dyn Resolver> = Arc::new(CachedResolver::new(resolver));
        let admission = Arc::new(Admission::new(&config, resolver, Arc::clone(&state)));
        Ok(Self {
            config,
            admission,
            state,
            commands: RwLock::new(None),
            coordinator: Mutex::new(None),
        })
    }

    /// Spawn the worker pool and the coordination thread.
    pub fn start(&self) -> SchedulerResult<()> {
        let mut commands = self.write_commands();
        if commands.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let workers = self.config.resolved_worker_pool_size();
        let sync = SyncExecutor::new(workers, Arc::clone(&self.state))?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SchedulerError::StartFailed(format!("coordination runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator =
            Coordinator::new(Arc::clone(&self.state), sync, Arc::clone(&self.admission));
        let handle = std::thread::Builder::new()
            .name("taskhub-coord".into())
            .spawn(move || {
                let done = runtime.block_on(coordinator.run(rx));
                // Tear the runtime down before acknowledging so no task
                // outlives `stop`.
                drop(runtime);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            })
            .map_err(|e| SchedulerError::StartFailed(format!("coordination thread: {}", e)))?;

        *commands = Some(tx);
        *self.lock_coordinator() = Some(handle);
        drop(commands);

        info!(
            workers,
            queue_capacity = ?self.config.queue_capacity,
            default_timeout = ?self.config.default_timeout(),
            "Scheduler started"
        );
        self.state
            .events()
            .publish(SchedulerEvent::scheduler(EventKind::Startup));
        Ok(())
    }

    /// Stop accepting tasks and shut the coordination thread down.
    ///
    /// With [`ShutdownMode::Wait`] this returns once every dispatched task
    /// is terminal. A stopped scheduler can be started again; records are
    /// kept.
    pub async fn stop(&self, mode: ShutdownMode) -> SchedulerResult<()> {
        let tx = self
            .write_commands()
            .take()
            .ok_or(SchedulerError::NotRunning)?;
        info!(?mode, "Scheduler shutdown requested");

        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Command::Shutdown { mode, done: done_tx }).is_ok() {
            // An error here means the coordinator is already gone.
            let _ = done_rx.await;
        }
        drop(tx);

        let handle = self.lock_coordinator().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Coordination thread panicked");
            }
        }
        info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.read_commands().is_some()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a snapshot of the current scheduler metrics.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.state.metrics()
    }

    /// Receive lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.state.events().subscribe()
    }

    pub(super) fn read_commands(
        &self,
    ) -> RwLockReadGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_commands(&self) -> RwLockWriteGuard<'_, Option<mpsc::UnboundedSender<Command>>> {
        self.commands
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_coordinator(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.coordinator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Scheduler {
    /// Request a cancel-mode stop without waiting for it.
    fn drop(&mut self) {
        let commands = match self.commands.get_mut() {
            Ok(c) => c.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = commands {
            let (done, _) = oneshot::channel();
            let _ = tx.send(Command::Shutdown {
                mode: ShutdownMode::Cancel,
                done,
            });
        }
    }
}
