//! The pipeline executor: graph-ordered, dependency-aware dispatch of
//! cloud operations to a delegate.

use crate::error::{SyncError, SyncResult};
use crate::graph::OperationGraph;
use crate::operation::{CloudOperation, OpStatus};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Executes network work for operations the pipeline dispatches.
///
/// `start_operation` is called from the pipeline's dispatcher thread; the
/// delegate reports the outcome back through
/// [`Pipeline::complete_operation`], [`Pipeline::skip_operation`], or
/// [`Pipeline::set_status_as_pending`]. The pipeline never decides an
/// operation's terminal disposition itself.
pub trait PipelineDelegate: Send + Sync {
    /// Begin executing an operation.
    fn start_operation(&self, operation: &CloudOperation, pipeline: &Pipeline);
}

/// Observes terminal dispositions, e.g. to purge the durable queue.
pub trait QueueObserver: Send + Sync {
    /// An operation reached `Completed` or `Skipped`.
    fn operation_resolved(&self, uuid: Uuid, status: OpStatus);
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum simultaneously started operations.
    pub max_concurrent: usize,
    /// Default attach policy for freshly inserted rows whose operation says
    /// [`crate::Attach::UseDefault`].
    pub default_attach: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            default_attach: true,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bound.
    #[must_use]
    pub const fn max_concurrent(mut self, value: usize) -> Self {
        self.max_concurrent = value;
        self
    }

    /// Sets the default attach policy.
    #[must_use]
    pub const fn default_attach(mut self, value: bool) -> Self {
        self.default_attach = value;
        self
    }
}

struct PipelineState {
    graphs: VecDeque<OperationGraph>,
    holds: HashMap<Uuid, Instant>,
    started_count: usize,
    suspend_count: u32,
    shutdown: bool,
    dispatcher_running: bool,
}

struct PipelineInner {
    name: String,
    config: PipelineConfig,
    delegate: RwLock<Option<Arc<dyn PipelineDelegate>>>,
    observers: RwLock<Vec<Arc<dyn QueueObserver>>>,
    state: Mutex<PipelineState>,
    signal: Condvar,
}

/// An ordered queue of operation graphs for one remote endpoint.
///
/// Graphs drain strictly in commit order; within a graph, operations
/// execute in dependency-and-priority order, bounded by
/// [`PipelineConfig::max_concurrent`]. A nestable suspend counter gates
/// dispatch without blocking graph submission or bookkeeping.
///
/// `Pipeline` is a shared handle; clones refer to the same queue.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Creates a pipeline. Dispatch begins once a delegate is set.
    #[must_use]
    pub fn new(name: impl Into<String>, config: PipelineConfig) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                name: name.into(),
                config,
                delegate: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
                state: Mutex::new(PipelineState {
                    graphs: VecDeque::new(),
                    holds: HashMap::new(),
                    started_count: 0,
                    suspend_count: 0,
                    shutdown: false,
                    dispatcher_running: false,
                }),
                signal: Condvar::new(),
            }),
        }
    }

    /// Returns the pipeline's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the pipeline's configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Sets the delegate and starts the dispatcher.
    pub fn set_delegate(&self, delegate: Arc<dyn PipelineDelegate>) {
        *self.inner.delegate.write() = Some(delegate);
        self.ensure_dispatcher();
        self.inner.signal.notify_all();
    }

    /// Registers an observer for terminal dispositions.
    pub fn add_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Submits a graph. The graph's dependency structure is validated here;
    /// a cycle fails fast instead of deadlocking the queue.
    ///
    /// Graphs are accepted while suspended and before a delegate exists;
    /// dispatch simply waits.
    pub fn submit_graph(&self, graph: OperationGraph) -> SyncResult<()> {
        graph.validate(&self.inner.name)?;
        let mut state = self.inner.state.lock();
        tracing::debug!(
            pipeline = %self.inner.name,
            snapshot = graph.snapshot,
            operations = graph.operations.len(),
            "graph submitted"
        );
        state.graphs.push_back(graph);
        drop(state);
        self.inner.signal.notify_all();
        Ok(())
    }

    // ========================================================================
    // Delegate callbacks
    // ========================================================================

    /// Marks an operation completed; it is purged from the durable queue.
    pub fn complete_operation(&self, uuid: Uuid) -> SyncResult<()> {
        self.resolve(uuid, OpStatus::Completed)
    }

    /// Marks an operation permanently skipped; it is purged from the
    /// durable queue and never retried.
    pub fn skip_operation(&self, uuid: Uuid) -> SyncResult<()> {
        self.resolve(uuid, OpStatus::Skipped)
    }

    /// Requeues a started operation, optionally holding it back for
    /// `retry_delay` (the exponential-backoff hook).
    pub fn set_status_as_pending(
        &self,
        uuid: Uuid,
        retry_delay: Option<Duration>,
    ) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(op) = state
                .graphs
                .iter_mut()
                .find_map(|graph| graph.operation_mut(uuid))
            else {
                return Err(SyncError::UnknownOperation { uuid });
            };
            match op.status {
                OpStatus::Completed | OpStatus::Skipped => {
                    return Err(SyncError::AlreadyResolved { uuid })
                }
                OpStatus::Started => {
                    op.status = OpStatus::Pending;
                    state.started_count = state.started_count.saturating_sub(1);
                }
                OpStatus::Pending => {}
            }
            match retry_delay {
                Some(delay) => {
                    state.holds.insert(uuid, Instant::now() + delay);
                }
                None => {
                    state.holds.remove(&uuid);
                }
            }
        }
        self.inner.signal.notify_all();
        Ok(())
    }

    fn resolve(&self, uuid: Uuid, status: OpStatus) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let Some(op) = state
                .graphs
                .iter_mut()
                .find_map(|graph| graph.operation_mut(uuid))
            else {
                return Err(SyncError::UnknownOperation { uuid });
            };
            if op.status.is_terminal() {
                return Err(SyncError::AlreadyResolved { uuid });
            }
            if op.status == OpStatus::Started {
                state.started_count = state.started_count.saturating_sub(1);
            }
            op.status = status;
            state.holds.remove(&uuid);
        }
        self.inner.signal.notify_all();
        let observers = self.inner.observers.read().clone();
        for observer in observers {
            observer.operation_resolved(uuid, status);
        }
        Ok(())
    }

    // ========================================================================
    // Suspend / resume
    // ========================================================================

    /// Increments the suspend counter; while it is nonzero no new
    /// operations are dispatched. Returns the new count.
    pub fn suspend(&self) -> u32 {
        let mut state = self.inner.state.lock();
        state.suspend_count += 1;
        state.suspend_count
    }

    /// Decrements the suspend counter, resuming dispatch when it reaches
    /// zero. Returns the new count.
    pub fn resume(&self) -> u32 {
        let count = {
            let mut state = self.inner.state.lock();
            state.suspend_count = state.suspend_count.saturating_sub(1);
            state.suspend_count
        };
        if count == 0 {
            self.inner.signal.notify_all();
        }
        count
    }

    /// Returns true while the suspend counter is nonzero.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.state.lock().suspend_count > 0
    }

    /// Returns the current suspend counter.
    #[must_use]
    pub fn suspend_count(&self) -> u32 {
        self.inner.state.lock().suspend_count
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns the number of queued (not fully drained) graphs.
    #[must_use]
    pub fn graph_count(&self) -> usize {
        self.inner.state.lock().graphs.len()
    }

    /// Returns the number of operations not yet in a terminal status.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .graphs
            .iter()
            .flat_map(|graph| graph.operations.iter())
            .filter(|op| !op.status.is_terminal())
            .count()
    }

    /// Returns an operation's status, or `None` if it was purged.
    #[must_use]
    pub fn status_of(&self, uuid: Uuid) -> Option<OpStatus> {
        self.inner
            .state
            .lock()
            .graphs
            .iter()
            .find_map(|graph| graph.operation(uuid))
            .map(|op| op.status)
    }

    /// Returns the still-pending operations targeting `path`, in queue
    /// order. Used to fold not-yet-sent local edits into a remote record
    /// during conflict resolution.
    #[must_use]
    pub fn pending_operations_for_path(&self, path: &str) -> Vec<CloudOperation> {
        self.inner
            .state
            .lock()
            .graphs
            .iter()
            .flat_map(|graph| graph.operations.iter())
            .filter(|op| op.status == OpStatus::Pending)
            .filter(|op| op.paths.iter().any(|p| p == path))
            .cloned()
            .collect()
    }

    /// Stops the dispatcher thread. Queued graphs are retained (and still
    /// durable); a later delegate assignment does not restart a shut-down
    /// pipeline.
    pub fn shutdown(&self) {
        self.inner.state.lock().shutdown = true;
        self.inner.signal.notify_all();
    }

    // ========================================================================
    // Dispatcher
    // ========================================================================

    fn ensure_dispatcher(&self) {
        let mut state = self.inner.state.lock();
        if state.dispatcher_running || state.shutdown {
            return;
        }
        state.dispatcher_running = true;
        drop(state);
        let pipeline = self.clone();
        thread::Builder::new()
            .name(format!("pipeline-{}", self.inner.name))
            .spawn(move || pipeline.run())
            .ok();
    }

    fn run(self) {
        loop {
            let to_start: Vec<CloudOperation>;
            {
                let mut guard = self.inner.state.lock();
                loop {
                    if guard.shutdown {
                        guard.dispatcher_running = false;
                        return;
                    }
                    while guard
                        .graphs
                        .front()
                        .is_some_and(OperationGraph::is_complete)
                    {
                        if let Some(graph) = guard.graphs.pop_front() {
                            tracing::debug!(
                                pipeline = %self.inner.name,
                                snapshot = graph.snapshot,
                                "graph drained"
                            );
                        }
                    }
                    let (selected, deadline) = self.select(&mut guard);
                    if !selected.is_empty() {
                        to_start = selected;
                        break;
                    }
                    match deadline {
                        Some(deadline) => {
                            let _ = self.inner.signal.wait_until(&mut guard, deadline);
                        }
                        None => {
                            self.inner.signal.wait(&mut guard);
                        }
                    }
                }
            }

            // Hand operations to the delegate outside the lock so it may
            // call back into the pipeline synchronously.
            let delegate = self.inner.delegate.read().clone();
            if let Some(delegate) = delegate {
                for operation in &to_start {
                    tracing::debug!(
                        pipeline = %self.inner.name,
                        uuid = %operation.uuid,
                        kind = %operation.kind,
                        "operation started"
                    );
                    delegate.start_operation(operation, &self);
                }
            }
        }
    }

    /// Picks the next operations to dispatch from the front graph. Returns
    /// the selection plus the nearest hold deadline if something is backed
    /// off.
    fn select(&self, state: &mut PipelineState) -> (Vec<CloudOperation>, Option<Instant>) {
        if state.suspend_count > 0 || self.inner.delegate.read().is_none() {
            return (Vec::new(), None);
        }
        let now = Instant::now();
        let mut deadline: Option<Instant> = None;
        let mut selected = Vec::new();

        let Some(front) = state.graphs.front_mut() else {
            return (Vec::new(), None);
        };
        for uuid in front.eligible() {
            if state.started_count + selected.len() >= self.inner.config.max_concurrent {
                break;
            }
            if let Some(&until) = state.holds.get(&uuid) {
                if until > now {
                    deadline = Some(deadline.map_or(until, |d| d.min(until)));
                    continue;
                }
            }
            if let Some(op) = front.operation_mut(uuid) {
                op.status = OpStatus::Started;
                selected.push(op.clone());
            }
        }
        state.started_count += selected.len();
        (selected, deadline)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("graph_count", &self.graph_count())
            .field("suspend_count", &self.suspend_count())
            .finish_non_exhaustive()
    }
}
