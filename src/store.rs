use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

use crate::stage::Stage;

/// Transient import state for one entity.
///
/// `display_progress` exists only to animate the overlay; read `raw_progress`
/// when the actual value matters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressRecord {
    pub entity_id: String,
    pub stage: Stage,
    pub raw_progress: u8,
    pub display_progress: f32,
    /// Failure reason pushed alongside an `Error` stage.
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    fn new(entity_id: &str, raw_progress: u8, stage: Stage, error: Option<String>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            stage,
            raw_progress,
            display_progress: f32::from(raw_progress),
            error,
            updated_at: Utc::now(),
        }
    }

    fn is_animating(&self) -> bool {
        self.display_progress < f32::from(self.raw_progress)
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<String, ProgressRecord>,
    /// Ids a running batch poll will clear itself; the sweep leaves them.
    pinned: HashSet<String>,
    /// Ids whose batch has settled. Late non-terminal pushes for them are
    /// redeliveries and never recreate a record.
    settled: HashSet<String>,
}

/// Keyed store of in-flight imports, shared by handle.
#[derive(Clone)]
pub struct ProgressStore {
    state: Arc<Mutex<StoreState>>,
    revision: Arc<watch::Sender<u64>>,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            revision: Arc::new(revision),
        }
    }

    /// Inserts or updates the record for `entity_id`. Returns `false` when the
    /// update was discarded as stale.
    pub fn set_progress(&self, entity_id: &str, raw_progress: u8, stage: Stage) -> bool {
        self.apply_update(entity_id, raw_progress, stage, None)
    }

    /// Like `set_progress`, keeping the failure reason when `stage` is `Error`.
    pub fn apply_update(
        &self,
        entity_id: &str,
        raw_progress: u8,
        stage: Stage,
        error: Option<String>,
    ) -> bool {
        let raw_progress = raw_progress.min(100);
        let error = error.filter(|_| stage == Stage::Error);
        {
            let mut state = self.state.lock();
            if !stage.is_terminal() && state.settled.contains(entity_id) {
                debug!(entity_id, incoming = %stage, "discarding update for settled entity");
                return false;
            }
            match state.records.get_mut(entity_id) {
                None => {
                    state.records.insert(
                        entity_id.to_string(),
                        ProgressRecord::new(entity_id, raw_progress, stage, error),
                    );
                }
                Some(record) => {
                    if stage.is_regression_from(record.stage) {
                        debug!(
                            entity_id,
                            incoming = %stage,
                            stored = %record.stage,
                            "discarding out-of-order stage update"
                        );
                        return false;
                    }
                    record.stage = stage;
                    record.raw_progress = raw_progress;
                    record.error = error;
                    record.updated_at = Utc::now();
                    record.display_progress =
                        record.display_progress.min(f32::from(raw_progress));
                }
            }
        }
        self.bump();
        true
    }

    pub fn get_progress(&self, entity_id: &str) -> Option<ProgressRecord> {
        self.state.lock().records.get(entity_id).cloned()
    }

    /// False for unknown entities, so callers still need the persisted
    /// fields to tell "never tracked" from "done".
    pub fn is_importing(&self, entity_id: &str) -> bool {
        self.state
            .lock()
            .records
            .get(entity_id)
            .map(|record| !record.stage.is_terminal())
            .unwrap_or(false)
    }

    pub fn clear_progress(&self, entity_id: &str) {
        let removed = self.state.lock().records.remove(entity_id).is_some();
        if removed {
            self.bump();
        }
    }

    pub fn clear_all_progress(&self) {
        let removed = {
            let mut state = self.state.lock();
            let had_records = !state.records.is_empty();
            state.records.clear();
            had_records
        };
        if removed {
            self.bump();
        }
    }

    /// Keeps the sweep away from `ids` until `settle` releases them.
    pub fn pin<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        let mut state = self.state.lock();
        for id in ids {
            state.settled.remove(id);
            state.pinned.insert(id.clone());
        }
    }

    /// Drops the records of a settled batch. From here on the persisted
    /// fields are authoritative, so only terminal pushes are still accepted.
    pub fn settle<'a>(&self, ids: impl IntoIterator<Item = &'a String>) {
        let removed = {
            let mut state = self.state.lock();
            let mut removed = false;
            for id in ids {
                state.pinned.remove(id);
                state.settled.insert(id.clone());
                removed |= state.records.remove(id).is_some();
            }
            removed
        };
        if removed {
            self.bump();
        }
    }

    /// Removes unpinned terminal records whose overlay has caught up and that
    /// have not changed for `grace`. Returns how many were removed.
    pub fn retire_finished(&self, grace: Duration) -> usize {
        let now = Utc::now();
        let retired = {
            let mut state = self.state.lock();
            let StoreState { records, pinned, .. } = &mut *state;
            let before = records.len();
            records.retain(|id, record| {
                pinned.contains(id)
                    || !record.stage.is_terminal()
                    || record.is_animating()
                    || now
                        .signed_duration_since(record.updated_at)
                        .to_std()
                        .map(|age| age < grace)
                        .unwrap_or(true)
            });
            before - records.len()
        };
        if retired > 0 {
            debug!(retired, "retired finished progress records");
            self.bump();
        }
        retired
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Receiver whose value changes whenever the visible state changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Moves every display value up toward its raw value by at most `step`.
    /// Returns whether any record still has ground to cover.
    pub fn advance_display(&self, step: f32) -> bool {
        let step = if step.is_finite() && step > 0.0 {
            step
        } else {
            return false;
        };
        let (changed, animating) = {
            let mut state = self.state.lock();
            let mut changed = false;
            let mut animating = false;
            for record in state.records.values_mut() {
                if !record.is_animating() {
                    continue;
                }
                let target = f32::from(record.raw_progress);
                record.display_progress = (record.display_progress + step).min(target);
                changed = true;
                animating |= record.is_animating();
            }
            (changed, animating)
        };
        if changed {
            self.bump();
        }
        animating
    }

    /// Runs `advance_display` and the `retire_finished` sweep once per
    /// `frame` until the handle is dropped.
    pub fn spawn_animator(
        &self,
        frame: Duration,
        step: f32,
        retire_grace: Duration,
    ) -> AnimatorHandle {
        let store = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval(frame);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if store.advance_display(step) {
                    trace!("display progress still animating");
                }
                store.retire_finished(retire_grace);
            }
        });
        AnimatorHandle { task }
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision = revision.wrapping_add(1));
    }
}

pub struct AnimatorHandle {
    task: JoinHandle<()>,
}

impl AnimatorHandle {
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for AnimatorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
