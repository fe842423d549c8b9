// THEORY:
// A capture session is one background task that drains a shuffled pool into a
// fixed number of slots. It is the simulated camera: every `cycle` it "shoots"
// the next dataset image, copies it into the archive, and records it.
//
// Key architectural principles:
// 1.  **Shared state, short locks**: `SessionState` lives behind a single
//     `std::sync::Mutex`. The worker takes it only to check termination, to
//     append a slot, and to publish the final transition. It is never held
//     across file I/O, SQLite, or an `.await`.
// 2.  **Generations**: each start (and each reset) bumps a generation number.
//     A worker only writes state while its own generation is still current,
//     so a reset that gives up waiting can never be overwritten later.
// 3.  **Cooperative cancel**: a flag checked at iteration boundaries, plus a
//     `Notify` that cuts the per-slot sleep short.
// 4.  **Failure is a state, never a crash**: whatever ends the loop, the
//     session lands in `stopped` with an optional message, and exactly one
//     bundling pass runs for its layer.

use crate::config::CaptureConfig;
use crate::core_modules::capture_store::{CaptureRecord, CaptureStore, NewCapture};
use crate::core_modules::dataset::{LayerId, PoolItem};
use crate::core_modules::labels;
use crate::core_modules::layer_bundler::{BundleReport, LayerBundler};
use crate::core_modules::pool_builder::PoolBuilder;
use crate::error::{CaptureError, Result};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, broadcast};

/// Mutable session bookkeeping shared between the gateway and the worker.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Pool identifiers of the filled slots, in fill order.
    pub images: Vec<String>,
    pub running: bool,
    pub stopped: bool,
    pub error: Option<String>,
    pub layer_current: u32,
    pub layer_total: u32,
    pub cancel_requested: bool,
    pub generation: u64,
}

impl SessionState {
    pub fn new(layer_total: u32) -> Self {
        Self {
            layer_total,
            ..Self::default()
        }
    }

    /// Moves to `running` for the next layer. Returns `None` if a session is
    /// already running, in which case nothing changes.
    pub fn begin(&mut self) -> Option<(LayerId, u64)> {
        if self.running {
            return None;
        }
        self.layer_current = self.layer_current.saturating_add(1).min(self.layer_total);
        self.images.clear();
        self.error = None;
        self.stopped = false;
        self.cancel_requested = false;
        self.running = true;
        self.generation += 1;
        Some((LayerId(self.layer_current), self.generation))
    }

    /// Forgets the current session entirely. Layer counters are kept.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.images.clear();
        self.running = false;
        self.stopped = false;
        self.error = None;
        self.cancel_requested = false;
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    fn should_stop(&self, generation: u64) -> bool {
        !self.is_current(generation) || self.cancel_requested
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Exhausted,
    Cancelled,
    Errored,
}

/// Published on every session state change.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        layer: LayerId,
        generation: u64,
    },
    SlotFilled {
        layer: LayerId,
        slot: usize,
        image: String,
        /// `false` when the copy failed and no record was written.
        recorded: bool,
    },
    Stopped {
        layer: LayerId,
        outcome: SessionOutcome,
        error: Option<String>,
    },
    Bundled {
        layer: LayerId,
        report: BundleReport,
    },
}

/// Everything a worker needs, shared with the gateway that spawned it.
#[derive(Debug)]
pub struct SessionShared {
    pub state: Mutex<SessionState>,
    pub cancel: Notify,
    pub events: broadcast::Sender<SessionEvent>,
    pub config: CaptureConfig,
    pub store: CaptureStore,
    pub bundler: LayerBundler,
}

impl SessionShared {
    /// Locks the session state. A poisoned lock still holds consistent data
    /// (every critical section is a handful of field writes), so it is recovered.
    pub fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is the normal case.
        let _ = self.events.send(event);
    }
}

enum Termination {
    Completed,
    Exhausted(String),
    Cancelled,
}

/// Runs one session to its end: fill slots, publish `Stopped`, bundle once.
pub async fn run_session(shared: Arc<SessionShared>, layer: LayerId, generation: u64) -> SessionOutcome {
    tracing::info!(layer = %layer, generation, "capture session started");

    let (outcome, error) = match fill_slots(&shared, layer, generation).await {
        Ok(Termination::Completed) => (SessionOutcome::Completed, None),
        Ok(Termination::Exhausted(message)) => {
            tracing::warn!(layer = %layer, "{message}");
            (SessionOutcome::Exhausted, Some(message))
        }
        Ok(Termination::Cancelled) => (SessionOutcome::Cancelled, None),
        Err(e) => {
            tracing::error!(layer = %layer, error = %e, "capture session failed");
            (SessionOutcome::Errored, Some(e.to_string()))
        }
    };

    finish(&shared, layer, generation, outcome, error).await;
    outcome
}

async fn fill_slots(shared: &Arc<SessionShared>, layer: LayerId, generation: u64) -> Result<Termination> {
    let config = &shared.config;
    let dataset_root = config.dataset_root.clone();
    let (mode, require_label) = (config.split_mode, config.require_label);
    let mut pool = tokio::task::spawn_blocking(move || {
        PoolBuilder::new(&dataset_root, mode, require_label).build()
    })
    .await??;

    let total = config.total_slots;
    loop {
        let (item, slot) = {
            let mut state = shared.lock_state();
            if state.should_stop(generation) {
                return Ok(Termination::Cancelled);
            }
            if state.images.len() >= total {
                return Ok(Termination::Completed);
            }
            let Some(item) = pool.pop_front() else {
                return Ok(Termination::Exhausted(format!(
                    "dataset pool exhausted after {} of {} slots",
                    state.images.len(),
                    total
                )));
            };
            state.images.push(item.id.clone());
            (item, state.images.len() - 1)
        };

        let store = shared.store.clone();
        let dataset_root = config.dataset_root.clone();
        let archive_root = config.archive_root.clone();
        let persisted = item.clone();
        let record = tokio::task::spawn_blocking(move || {
            persist_slot(&store, &dataset_root, &archive_root, layer, &persisted)
        })
        .await??;

        tracing::debug!(layer = %layer, slot, image = %item.id, "slot filled");
        shared.publish(SessionEvent::SlotFilled {
            layer,
            slot,
            image: item.id,
            recorded: record.is_some(),
        });

        pause(shared, generation).await;
    }
}

/// Sleeps one cycle, returning early on cancel.
async fn pause(shared: &SessionShared, generation: u64) {
    let cancelled = shared.cancel.notified();
    tokio::pin!(cancelled);
    // Register before checking the flag so a cancel in between is not lost.
    cancelled.as_mut().enable();
    let stop = shared.lock_state().should_stop(generation);
    if stop {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(shared.config.cycle()) => {}
        _ = &mut cancelled => {}
    }
}

/// Copies one pool item into the archive and records it. A failed copy is
/// skipped (`Ok(None)`); only a store failure is an error.
pub fn persist_slot(
    store: &CaptureStore,
    dataset_root: &Path,
    archive_root: &Path,
    layer: LayerId,
    item: &PoolItem,
) -> Result<Option<CaptureRecord>> {
    let source = item.source_path(dataset_root);
    let dir = layer.captures_dir(archive_root);
    let ts = Utc::now();
    let dest = dir.join(format!(
        "{}_{}_{}",
        ts.format("%Y%m%dT%H%M%S%6fZ"),
        item.split,
        item.file_name()
    ));

    let copied = std::fs::create_dir_all(&dir)
        .map_err(|e| CaptureError::io(&dir, e))
        .and_then(|_| std::fs::copy(&source, &dest).map_err(|e| CaptureError::io(&source, e)));
    if let Err(e) = copied {
        tracing::warn!(layer = %layer, image = %item.id, error = %e, "copy failed, slot not recorded");
        return Ok(None);
    }

    let label_path = item.label_path(dataset_root);
    let boxes = labels::read_label_file(&label_path).unwrap_or_else(|e| {
        tracing::warn!(path = ?label_path, error = %e, "unusable label file, storing no boxes");
        Vec::new()
    });

    let record = store.append(&NewCapture {
        path: dest,
        layer,
        split: item.split,
        ts,
        src_path: source,
        boxes,
    })?;
    Ok(Some(record))
}

async fn finish(
    shared: &Arc<SessionShared>,
    layer: LayerId,
    generation: u64,
    outcome: SessionOutcome,
    error: Option<String>,
) {
    let filled = {
        let mut state = shared.lock_state();
        if state.is_current(generation) {
            state.running = false;
            state.stopped = true;
            state.error = error.clone();
        }
        state.images.len()
    };
    tracing::info!(layer = %layer, ?outcome, slots = filled, "capture session stopped");
    shared.publish(SessionEvent::Stopped { layer, outcome, error });

    let bundler = shared.bundler.clone();
    match tokio::task::spawn_blocking(move || bundler.bundle(layer)).await {
        Ok(Ok(report)) => shared.publish(SessionEvent::Bundled { layer, report }),
        Ok(Err(e)) => tracing::error!(layer = %layer, error = %e, "bundling failed"),
        Err(e) => tracing::error!(layer = %layer, error = %e, "bundling task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::dataset::Split;

    #[test]
    fn begin_advances_layer_and_refuses_while_running() {
        let mut state = SessionState::new(2);
        state.images.push("stale".into());
        state.error = Some("old".into());
        state.stopped = true;

        assert_eq!(state.begin(), Some((LayerId(1), 1)));
        assert!(state.running && !state.stopped);
        assert!(state.images.is_empty() && state.error.is_none());

        state.images.push("train/images/a.jpg".into());
        assert_eq!(state.begin(), None);
        assert_eq!(state.layer_current, 1);
        assert_eq!(state.images.len(), 1);
    }

    #[test]
    fn layer_counter_is_capped() {
        let mut state = SessionState::new(2);
        for _ in 0..4 {
            state.begin();
            state.running = false;
        }
        assert_eq!(state.layer_current, 2);
        assert_eq!(state.generation, 4);
    }

    #[test]
    fn clear_invalidates_the_running_generation() {
        let mut state = SessionState::new(5);
        let (_, generation) = state.begin().unwrap();
        state.clear();

        assert!(!state.is_current(generation));
        assert!(state.should_stop(generation));
        assert!(!state.running && !state.stopped);
        assert_eq!(state.layer_current, 1);
    }

    #[test]
    fn persist_slot_copies_and_records_boxes() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        let archive = dir.path().join("archive");
        std::fs::create_dir_all(dataset.join("train/images")).unwrap();
        std::fs::create_dir_all(dataset.join("train/labels")).unwrap();
        std::fs::write(dataset.join("train/images/a.jpg"), b"pixels").unwrap();
        std::fs::write(dataset.join("train/labels/a.txt"), "2 0.5 0.5 0.1 0.1\n").unwrap();
        let store = CaptureStore::open(&dir.path().join("c.db"), &archive, &dataset).unwrap();

        let item = PoolItem::new(Split::Train, "a.jpg");
        let record = persist_slot(&store, &dataset, &archive, LayerId(3), &item)
            .unwrap()
            .unwrap();

        assert!(record.path.starts_with(archive.join("captures/layer_3")));
        let name = record.path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_train_a.jpg"), "{name}");
        assert_eq!(std::fs::read(&record.path).unwrap(), b"pixels");
        assert_eq!(record.boxes.len(), 1);
        assert_eq!(record.boxes[0].cls, 2);
        assert!(store.is_managed_path(&record.path));
    }

    #[test]
    fn persist_slot_skips_missing_sources_and_tolerates_bad_labels() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("dataset");
        let archive = dir.path().join("archive");
        std::fs::create_dir_all(dataset.join("valid/images")).unwrap();
        std::fs::create_dir_all(dataset.join("valid/labels")).unwrap();
        std::fs::write(dataset.join("valid/images/b.png"), b"pixels").unwrap();
        std::fs::write(dataset.join("valid/labels/b.txt"), "not a label\n").unwrap();
        let store = CaptureStore::open(&dir.path().join("c.db"), &archive, &dataset).unwrap();

        let missing = PoolItem::new(Split::Valid, "gone.png");
        assert!(persist_slot(&store, &dataset, &archive, LayerId(1), &missing).unwrap().is_none());

        let bad_label = PoolItem::new(Split::Valid, "b.png");
        let record = persist_slot(&store, &dataset, &archive, LayerId(1), &bad_label)
            .unwrap()
            .unwrap();
        assert!(record.boxes.is_empty());
        assert_eq!(store.count(Some(LayerId(1))).unwrap(), 1);
    }
}
