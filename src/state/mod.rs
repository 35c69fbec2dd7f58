//! The observable record a [`Store`](crate::store::Store) maintains for its operation: the last
//! known value and error, when they were last updated, and which tasks are currently running.

pub mod infinite;

use smallvec::SmallVec;

use crate::context::{ResultUpdateReason, Timestamp};
use crate::error::OperationError;
use crate::task::TaskId;

pub use infinite::{InfiniteQueryState, InfiniteValue, Page, PageSequence};

/// Where a value/error pair currently stands relative to the last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No run has ever completed.
    Idle,
    /// A run is in flight. A previous value/error, if any, is still readable.
    Running,
    /// The most recent completed run produced a value.
    Success,
    /// The most recent completed run produced an error.
    Failure,
}

/// One task currently contributing to a store's state, tracked so a reset or a subsequent
/// `is_stale` check can tell which runs are still "current."
#[derive(Debug, Clone, Copy)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub started_at: Timestamp,
}

/// The observable state of a single operation: its last value, last error, status, update
/// bookkeeping, and the tasks currently running against it.
///
/// Generic over `V` (the success value) and `F` (the operation's own failure type). `QueryState`
/// and `MutationState` are both plain aliases of this type — they differ only in which
/// [`Operation`](crate::operation::Operation) adapter drives them, not in what they observe.
#[derive(Debug, Clone)]
pub struct OperationState<V, F> {
    status: Status,
    value: Option<V>,
    error: Option<OperationError<F>>,
    value_last_updated_at: Option<Timestamp>,
    error_last_updated_at: Option<Timestamp>,
    value_update_count: u64,
    error_update_count: u64,
    active_tasks: SmallVec<[TaskDescriptor; 1]>,
}

impl<V, F> Default for OperationState<V, F> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            value: None,
            error: None,
            value_last_updated_at: None,
            error_last_updated_at: None,
            value_update_count: 0,
            error_update_count: 0,
            active_tasks: SmallVec::new(),
        }
    }
}

impl<V, F> OperationState<V, F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn error(&self) -> Option<&OperationError<F>> {
        self.error.as_ref()
    }

    pub fn value_last_updated_at(&self) -> Option<Timestamp> {
        self.value_last_updated_at
    }

    pub fn error_last_updated_at(&self) -> Option<Timestamp> {
        self.error_last_updated_at
    }

    pub fn value_update_count(&self) -> u64 {
        self.value_update_count
    }

    pub fn error_update_count(&self) -> u64 {
        self.error_update_count
    }

    pub fn is_running(&self) -> bool {
        !self.active_tasks.is_empty()
    }

    pub fn active_tasks(&self) -> &[TaskDescriptor] {
        &self.active_tasks
    }

    /// Records a newly-started task as actively contributing to this state.
    pub fn begin_task(&mut self, task: TaskDescriptor) {
        self.active_tasks.push(task);
        self.status = Status::Running;
    }

    /// Removes a finished task from the active set, restoring `Idle`/`Success`/`Failure` once no
    /// task remains.
    pub fn end_task(&mut self, task_id: TaskId) {
        self.active_tasks.retain(|task| task.id != task_id);
        if self.active_tasks.is_empty() {
            self.status = match (&self.value, &self.error) {
                (_, Some(_)) => Status::Failure,
                (Some(_), None) => Status::Success,
                (None, None) => Status::Idle,
            };
        }
    }

    /// Applies a yielded or final result from a running task. `reason` distinguishes a
    /// [`Continuation`](crate::continuation::Continuation) yield from the task's terminal return,
    /// but both update the record identically — last-write-wins across concurrent non-deduplicated
    /// runs, matching concurrent non-deduplicated runs being explicitly permitted.
    pub fn apply_result(
        &mut self,
        reason: ResultUpdateReason,
        result: Result<V, OperationError<F>>,
        now: Timestamp,
    ) {
        let _ = reason;
        match result {
            Ok(value) => {
                self.value = Some(value);
                self.error = None;
                self.value_last_updated_at = Some(now);
                self.value_update_count += 1;
            }
            Err(error) => {
                self.error = Some(error);
                self.error_last_updated_at = Some(now);
                self.error_update_count += 1;
            }
        }
        if self.active_tasks.is_empty() {
            self.status = match &self.error {
                Some(_) => Status::Failure,
                None => Status::Success,
            };
        }
    }

    /// Clears the value, error, and bookkeeping back to their initial state. Active tasks are left
    /// untouched here — the store is responsible for deciding whether in-flight tasks survive a
    /// reset or are abandoned via a herd-counter bump.
    pub fn reset(&mut self) {
        self.value = None;
        self.error = None;
        self.value_last_updated_at = None;
        self.error_last_updated_at = None;
        self.value_update_count = 0;
        self.error_update_count = 0;
        self.status = if self.active_tasks.is_empty() {
            Status::Idle
        } else {
            Status::Running
        };
    }
}

/// Alias for a query's observable state: its last fetched value and last error.
pub type QueryState<V, F> = OperationState<V, F>;

/// Alias for a mutation's observable state: its last result and last error. A mutation's
/// arguments are not part of this record — they travel through the run's `Context` via a
/// generically-keyed `ArgumentsKey<A>`, not through the state.
pub type MutationState<V, F> = OperationState<V, F>;
