//! In-memory execution record store.
//!
//! The store is the single place execution state lives. Every mutation goes
//! through one mutex, and each record carries a `watch` channel that is
//! poked after every change so readers (cancel waiters, output streams) can
//! wake without polling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::Stream;
use tokio::sync::watch;

use crate::errors::ExecutionError;
use crate::execution::lock::{ProjectLockGuard, abort_on_lock_fault};
use crate::execution::{Execution, ExecutionId, ExecutionState};

pub const DEFAULT_MAX_RETAINED: usize = 200;

struct Record {
    execution: Execution,
    changed: watch::Sender<()>,
}

#[derive(Clone)]
pub struct ExecutionStore {
    records: Arc<Mutex<HashMap<ExecutionId, Record>>>,
    max_retained: usize,
}

impl Default for ExecutionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETAINED)
    }
}

impl ExecutionStore {
    pub fn new(max_retained: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            max_retained,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, Record>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, execution: Execution) {
        let mut records = self.lock();
        let (changed, _) = watch::channel(());
        records.insert(execution.id, Record { execution, changed });
        evict_terminal(&mut records, self.max_retained);
    }

    /// Point-in-time snapshot.
    pub fn get(&self, id: ExecutionId) -> Option<Execution> {
        self.lock().get(&id).map(|r| r.execution.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recently created execution for a project, if any is retained.
    pub fn latest_for_project(&self, project_id: &str) -> Option<Execution> {
        self.lock()
            .values()
            .filter(|r| r.execution.project_id == project_id)
            .max_by_key(|r| r.execution.created_at)
            .map(|r| r.execution.clone())
    }

    /// Apply a non-terminal state change. Terminal states must go through
    /// [`ExecutionStore::finish`] so the project lock is released atomically.
    pub fn transition(
        &self,
        id: ExecutionId,
        to: ExecutionState,
        mutate: impl FnOnce(&mut Execution),
    ) -> Result<Execution, ExecutionError> {
        let mut records = self.lock();
        let record = records
            .get_mut(&id)
            .ok_or(ExecutionError::NotFound { id })?;
        let from = record.execution.state;
        if to.is_terminal() || !from.can_transition_to(to) {
            return Err(ExecutionError::InvalidTransition { from, to });
        }
        mutate(&mut record.execution);
        record.execution.state = to;
        if to == ExecutionState::Running {
            record.execution.started_at = Some(Utc::now());
        }
        record.changed.send_replace(());
        Ok(record.execution.clone())
    }

    /// Move an execution into a terminal state and release its project lock
    /// in the same critical section, so no observer can see a terminal
    /// record whose project is still locked.
    ///
    /// The lock is released even when the transition itself is rejected.
    pub fn finish(
        &self,
        id: ExecutionId,
        to: ExecutionState,
        mutate: impl FnOnce(&mut Execution),
        lock: Option<ProjectLockGuard>,
    ) -> Result<Execution, ExecutionError> {
        let mut records = self.lock();
        let result = match records.get_mut(&id) {
            None => Err(ExecutionError::NotFound { id }),
            Some(record) => {
                let from = record.execution.state;
                if !to.is_terminal() || !from.can_transition_to(to) {
                    Err(ExecutionError::InvalidTransition { from, to })
                } else {
                    mutate(&mut record.execution);
                    record.execution.state = to;
                    record.execution.ended_at = Some(Utc::now());
                    record.execution.idle = false;
                    Ok(record.execution.clone())
                }
            }
        };

        if let Some(guard) = lock
            && let Err(err) = guard.release()
        {
            abort_on_lock_fault(&err);
        }

        if let Some(record) = records.get(&id) {
            record.changed.send_replace(());
        }
        evict_terminal(&mut records, self.max_retained);
        result
    }

    /// Append a chunk to the output log. Returns false once the execution no
    /// longer accepts output.
    pub fn append_output(&self, id: ExecutionId, chunk: &str) -> bool {
        let mut records = self.lock();
        let Some(record) = records.get_mut(&id) else {
            return false;
        };
        if !record.execution.state.accepts_output() {
            return false;
        }
        record.execution.output.push(chunk.to_string());
        record.execution.output_bytes += chunk.len();
        record.execution.last_output_at = Some(Utc::now());
        record.changed.send_replace(());
        true
    }

    pub fn set_idle(&self, id: ExecutionId, idle: bool) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(&id)
            && record.execution.idle != idle
            && !record.execution.state.is_terminal()
        {
            record.execution.idle = idle;
            record.changed.send_replace(());
        }
    }

    /// Chunks at index `offset` and later, plus whether the log is final.
    pub fn output_since(&self, id: ExecutionId, offset: usize) -> Option<(Vec<String>, bool)> {
        let records = self.lock();
        let execution = &records.get(&id)?.execution;
        let chunks = execution.output.iter().skip(offset).cloned().collect();
        Some((chunks, execution.state.is_terminal()))
    }

    pub fn subscribe(&self, id: ExecutionId) -> Option<watch::Receiver<()>> {
        self.lock().get(&id).map(|r| r.changed.subscribe())
    }

    /// Resolve once the execution reaches a terminal state. `None` if the
    /// record is unknown or evicted while waiting.
    pub async fn wait_terminal(&self, id: ExecutionId) -> Option<Execution> {
        let mut changed = self.subscribe(id)?;
        loop {
            let snapshot = self.get(id)?;
            if snapshot.state.is_terminal() {
                return Some(snapshot);
            }
            changed.changed().await.ok()?;
        }
    }

    /// Live tail of the output log starting at chunk `offset`. The stream
    /// ends once the execution is terminal and every chunk has been yielded.
    pub fn stream_output(
        &self,
        id: ExecutionId,
        offset: usize,
    ) -> Option<impl Stream<Item = String> + Send + 'static + use<>> {
        let changed = self.subscribe(id)?;
        let state = (self.clone(), changed, offset, VecDeque::new());
        Some(futures::stream::unfold(
            state,
            move |(store, mut changed, mut offset, mut pending)| async move {
                loop {
                    if let Some(chunk) = pending.pop_front() {
                        return Some((chunk, (store, changed, offset, pending)));
                    }
                    let (chunks, finished) = store.output_since(id, offset)?;
                    if !chunks.is_empty() {
                        offset += chunks.len();
                        pending.extend(chunks);
                        continue;
                    }
                    if finished {
                        return None;
                    }
                    changed.changed().await.ok()?;
                }
            },
        ))
    }
}

/// Once more than `max_retained` terminal records are held, drop the ones
/// that ended first. Non-terminal records are never evicted.
fn evict_terminal(records: &mut HashMap<ExecutionId, Record>, max_retained: usize) {
    let mut terminal: Vec<_> = records
        .values()
        .filter(|r| r.execution.state.is_terminal())
        .map(|r| (r.execution.ended_at, r.execution.id))
        .collect();
    if terminal.len() <= max_retained {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - max_retained;
    for (_, id) in terminal.into_iter().take(excess) {
        records.remove(&id);
    }
}
