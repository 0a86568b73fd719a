use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{TaskId, TaskRecord, TaskRequest, TaskStatus, TaskSummary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("task {id} cannot move from {from} to {to}")]
    IllegalTransition { id: TaskId, from: TaskStatus, to: TaskStatus },
}

/// Heap entry: highest priority first, then oldest creation time, then
/// arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    arrival: u64,
    id: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.arrival.cmp(&self.arrival))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Slot {
    record: TaskRecord,
    arrival: u64,
}

impl Slot {
    fn entry(&self) -> QueueEntry {
        QueueEntry {
            priority: self.record.priority,
            created_at: self.record.created_at,
            arrival: self.arrival,
            id: self.record.id,
        }
    }
}

struct State {
    tasks: HashMap<TaskId, Slot>,
    /// May hold stale entries for paused or cancelled tasks; they are
    /// skipped when popped.
    queue: BinaryHeap<QueueEntry>,
    running: usize,
    limit: usize,
    next_arrival: u64,
    /// Tasks changed since the last `take_dirty`.
    dirty: HashSet<TaskId>,
}

/// Priority queue of task records with admission control: at most `limit`
/// tasks are `DOWNLOADING` at once. Every operation is a short critical
/// section under one lock; nothing here does I/O.
pub struct Scheduler {
    state: Mutex<State>,
}

impl Scheduler {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                queue: BinaryHeap::new(),
                running: 0,
                limit: limit.max(1),
                next_arrival: 0,
                dirty: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store and enqueue a new task. Never blocks on admission.
    pub fn submit(&self, request: TaskRequest) -> TaskId {
        let mut state = self.lock();
        let mut id = request.id.unwrap_or_else(Uuid::new_v4);
        if state.tasks.contains_key(&id) {
            let fresh = Uuid::new_v4();
            tracing::warn!("task id {} already in use, assigning {}", id, fresh);
            id = fresh;
        }
        let record = TaskRecord {
            id,
            input: request.input,
            config: request.config,
            priority: request.priority,
            status: TaskStatus::Pending,
            progress: 0.0,
            created_at: request.created_at.unwrap_or_else(Utc::now),
            started_at: None,
            completed_at: None,
            error: None,
        };
        let arrival = state.next_arrival;
        state.next_arrival += 1;
        let slot = Slot { record, arrival };
        state.queue.push(slot.entry());
        state.tasks.insert(id, slot);
        state.dirty.insert(id);
        tracing::info!("submitted task {}", id);
        id
    }

    /// Admit the highest-priority pending task if a slot is free.
    pub fn next(&self) -> Option<TaskRecord> {
        let mut state = self.lock();
        if state.running >= state.limit {
            return None;
        }
        while let Some(entry) = state.queue.pop() {
            let Some(slot) = state.tasks.get_mut(&entry.id) else { continue };
            if slot.record.status != TaskStatus::Pending {
                continue;
            }
            slot.record.status = TaskStatus::Downloading;
            slot.record.started_at = Some(Utc::now());
            let record = slot.record.clone();
            state.running += 1;
            state.dirty.insert(entry.id);
            tracing::info!("admitted task {} (priority {})", entry.id, record.priority);
            return Some(record);
        }
        None
    }

    /// Finish a downloading task and release its slot. Unknown ids are a
    /// no-op.
    pub fn complete(&self, id: TaskId, success: bool, error: Option<String>) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        let Some(slot) = state.tasks.get_mut(&id) else {
            tracing::debug!("complete for unknown task {}", id);
            return Ok(());
        };
        let to = if success { TaskStatus::Completed } else { TaskStatus::Failed };
        let from = slot.record.status;
        if from != TaskStatus::Downloading {
            tracing::warn!("rejected completion of task {} in state {}", id, from);
            return Err(SchedulerError::IllegalTransition { id, from, to });
        }
        slot.record.status = to;
        slot.record.completed_at = Some(Utc::now());
        if success {
            slot.record.progress = 100.0;
            slot.record.error = None;
        } else {
            slot.record.error = Some(error.unwrap_or_else(|| "download failed".to_string()));
        }
        state.running = state.running.saturating_sub(1);
        state.dirty.insert(id);
        if success {
            tracing::info!("task {} completed", id);
        } else {
            tracing::error!("task {} failed", id);
        }
        Ok(())
    }

    /// Record progress of a downloading task; `percent` must be in `[0, 100]`.
    pub fn update_progress(&self, id: TaskId, percent: f64) -> bool {
        if !(0.0..=100.0).contains(&percent) {
            tracing::warn!("ignoring out-of-range progress {} for task {}", percent, id);
            return false;
        }
        let mut state = self.lock();
        let Some(slot) = state.tasks.get_mut(&id) else { return false };
        if slot.record.status != TaskStatus::Downloading {
            return false;
        }
        slot.record.progress = percent;
        state.dirty.insert(id);
        true
    }

    pub fn pause(&self, id: TaskId) -> bool {
        self.transition(id, TaskStatus::Paused, |_| true)
    }

    /// Re-queue a paused task with its original priority and creation time.
    pub fn resume(&self, id: TaskId) -> bool {
        self.transition(id, TaskStatus::Pending, |from| from == TaskStatus::Paused)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.transition(id, TaskStatus::Cancelled, |_| true)
    }

    /// Put an interrupted `DOWNLOADING` task back in the queue and release
    /// its slot.
    pub fn requeue(&self, id: TaskId) -> bool {
        self.transition(id, TaskStatus::Pending, |from| from == TaskStatus::Downloading)
    }

    fn transition(&self, id: TaskId, to: TaskStatus, allowed_from: impl Fn(TaskStatus) -> bool) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.tasks.get_mut(&id) else { return false };
        let from = slot.record.status;
        if !allowed_from(from) || !from.can_transition_to(to) {
            tracing::debug!("task {}: {} -> {} rejected", id, from, to);
            return false;
        }
        slot.record.status = to;
        match to {
            TaskStatus::Cancelled => slot.record.completed_at = Some(Utc::now()),
            TaskStatus::Pending => slot.record.started_at = None,
            _ => {}
        }
        let entry = (to == TaskStatus::Pending).then(|| slot.entry());
        if let Some(entry) = entry {
            state.queue.push(entry);
        }
        if from == TaskStatus::Downloading {
            state.running = state.running.saturating_sub(1);
        }
        state.dirty.insert(id);
        tracing::info!("task {}: {} -> {}", id, from, to);
        true
    }

    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.lock().tasks.get(&id).map(|slot| slot.record.clone())
    }

    /// All tasks, oldest first.
    pub fn list(&self) -> Vec<TaskRecord> {
        let state = self.lock();
        let mut slots: Vec<&Slot> = state.tasks.values().collect();
        slots.sort_by_key(|slot| (slot.record.created_at, slot.arrival));
        slots.into_iter().map(|slot| slot.record.clone()).collect()
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.list().iter().map(TaskRecord::summary).collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running
    }

    /// Nothing is downloading and nothing is waiting for admission.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.running == 0 && !state.tasks.values().any(|slot| slot.record.status == TaskStatus::Pending)
    }

    pub fn limit(&self) -> usize {
        self.lock().limit
    }

    /// Lowering the limit never interrupts running tasks; it only delays new
    /// admissions.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.limit = limit.max(1);
        tracing::info!("max concurrent downloads set to {}", state.limit);
    }

    /// Load records from a previous run. Tasks caught mid-download go back
    /// to `PENDING`; their sessions on disk let the engine resume them.
    pub fn restore(&self, mut records: Vec<TaskRecord>) {
        let mut state = self.lock();
        records.sort_by_key(|r| r.created_at);
        for mut record in records {
            if state.tasks.contains_key(&record.id) {
                continue;
            }
            if record.status == TaskStatus::Downloading {
                record.status = TaskStatus::Pending;
                record.started_at = None;
                state.dirty.insert(record.id);
            }
            let arrival = state.next_arrival;
            state.next_arrival += 1;
            let slot = Slot { record, arrival };
            if slot.record.status == TaskStatus::Pending {
                state.queue.push(slot.entry());
            }
            state.tasks.insert(slot.record.id, slot);
        }
        tracing::info!("restored {} tasks", state.tasks.len());
    }

    /// Snapshots of tasks changed since the previous call.
    pub fn take_dirty(&self) -> Vec<TaskRecord> {
        let mut state = self.lock();
        let ids: Vec<TaskId> = state.dirty.drain().collect();
        ids.iter()
            .filter_map(|id| state.tasks.get(id).map(|slot| slot.record.clone()))
            .collect()
    }
}
