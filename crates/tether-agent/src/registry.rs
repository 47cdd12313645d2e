//! Concurrent registries of tracked tasks.
//!
//! A task is tracked from the moment its assign event is accepted until its
//! worker finishes. Every reservation carries a fresh `attempt` number and all
//! worker-side removals match on it, so a stale worker unwinding after an abort
//! never removes the record of a newer assignment of the same task id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_core::ids::TaskId;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Queued,
    Acquiring,
    Executing,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::TimedOut
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub task_id: TaskId,
    pub attempt: u64,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
    pub status: ExecutionStatus,
}

/// Handle returned to the worker that won the reservation.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub task_id: TaskId,
    pub attempt: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ExecutingTask {
    pub attempt: u64,
    pub task_type: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    records: DashMap<TaskId, ExecutionRecord>,
    acquiring: DashMap<TaskId, u64>,
    validating: DashMap<TaskId, u64>,
    executing: DashMap<TaskId, ExecutingTask>,
    next_attempt: AtomicU64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a placeholder record unless one exists. Losers get `None`.
    pub fn try_reserve(&self, task_id: &TaskId) -> Option<Reservation> {
        match self.records.entry(task_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
                let cancel = CancellationToken::new();
                slot.insert(ExecutionRecord {
                    task_id: task_id.clone(),
                    attempt,
                    queued_at: Utc::now(),
                    started_at: None,
                    cancel: cancel.clone(),
                    status: ExecutionStatus::Queued,
                });
                Some(Reservation {
                    task_id: task_id.clone(),
                    attempt,
                    cancel,
                })
            }
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.records.contains_key(task_id)
    }

    pub fn record(&self, task_id: &TaskId) -> Option<ExecutionRecord> {
        self.records.get(task_id).map(|r| r.clone())
    }

    /// Move the record owned by `attempt` to `status`. Returns false if the
    /// record is gone or belongs to another attempt.
    pub fn set_status(&self, task_id: &TaskId, attempt: u64, status: ExecutionStatus) -> bool {
        match self.records.get_mut(task_id) {
            Some(mut record) if record.attempt == attempt => {
                if status == ExecutionStatus::Executing && record.started_at.is_none() {
                    record.started_at = Some(Utc::now());
                }
                record.status = status;
                true
            }
            _ => false,
        }
    }

    /// Enter the currently-acquiring set. False if the task is already there.
    pub fn begin_acquire(&self, task_id: &TaskId, attempt: u64) -> bool {
        insert_once(&self.acquiring, task_id, attempt)
    }

    pub fn end_acquire(&self, task_id: &TaskId, attempt: u64) {
        self.acquiring.remove_if(task_id, |_, a| *a == attempt);
    }

    pub fn is_acquiring(&self, task_id: &TaskId) -> bool {
        self.acquiring.contains_key(task_id)
    }

    /// Enter the validating set while the package is prepared for execution.
    pub fn begin_validation(&self, task_id: &TaskId, attempt: u64) -> bool {
        insert_once(&self.validating, task_id, attempt)
    }

    pub fn end_validation(&self, task_id: &TaskId, attempt: u64) {
        self.validating.remove_if(task_id, |_, a| *a == attempt);
    }

    /// Insert into the executing map exactly once per task id.
    pub fn begin_execution(&self, task_id: &TaskId, attempt: u64, task_type: &str) -> bool {
        match self.executing.entry(task_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ExecutingTask {
                    attempt,
                    task_type: task_type.to_string(),
                    started_at: Utc::now(),
                });
                true
            }
        }
    }

    pub fn end_execution(&self, task_id: &TaskId, attempt: u64) {
        self.executing.remove_if(task_id, |_, t| t.attempt == attempt);
    }

    /// Drop every trace of `attempt`. Safe to call more than once.
    pub fn finish(&self, task_id: &TaskId, attempt: u64) -> Option<ExecutionRecord> {
        self.acquiring.remove_if(task_id, |_, a| *a == attempt);
        self.validating.remove_if(task_id, |_, a| *a == attempt);
        self.executing.remove_if(task_id, |_, t| t.attempt == attempt);
        self.records
            .remove_if(task_id, |_, r| r.attempt == attempt)
            .map(|(_, record)| record)
    }

    /// Cancel and forget the task whatever attempt owns it.
    pub fn abort(&self, task_id: &TaskId) -> Option<ExecutionRecord> {
        self.validating.remove(task_id);
        self.acquiring.remove(task_id);
        self.executing.remove(task_id);
        let (_, mut record) = self.records.remove(task_id)?;
        record.cancel.cancel();
        record.status = ExecutionStatus::Cancelled;
        Some(record)
    }

    /// Cancel every tracked task, leaving records for their workers to clean up.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for record in self.records.iter() {
            if !record.cancel.is_cancelled() {
                record.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn executing_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.executing.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn executing_count(&self) -> usize {
        self.executing.len()
    }

    /// Tasks tracked anywhere between acceptance and cleanup.
    pub fn in_flight_count(&self) -> usize {
        self.records.len()
    }

    pub fn acquiring_count(&self) -> usize {
        self.acquiring.len()
    }

    pub fn validating_count(&self) -> usize {
        self.validating.len()
    }

    /// True when nothing is tracked in any registry.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
            && self.acquiring.is_empty()
            && self.validating.is_empty()
            && self.executing.is_empty()
    }
}

fn insert_once(map: &DashMap<TaskId, u64>, task_id: &TaskId, attempt: u64) -> bool {
    match map.entry(task_id.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(attempt);
            true
        }
    }
}
