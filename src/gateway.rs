// THEORY:
// The `SessionGateway` is the only door into the capture core. The web layer
// (routes, templates, auth) is not part of this crate; it holds a gateway and
// calls these methods, serializing the returned structs straight to JSON.
//
// Key architectural principles:
// 1.  **One session at a time**: `start` checks and sets `running` in a single
//     critical section, so concurrent callers get exactly one worker and
//     everyone else gets `already_running`.
// 2.  **Snapshots, not references**: `status` and `layers` copy out of the lock.
//     Callers never see a guard.
// 3.  **Polling stays the contract**: the broadcast channel from `subscribe`
//     is a convenience. Every fact it carries is also visible through `status`.
// 4.  **Blocking work off the executor**: store and filesystem calls made on
//     behalf of a caller run through `spawn_blocking`.

use crate::config::CaptureConfig;
use crate::core_modules::capture_session::{self, SessionEvent, SessionShared, SessionState};
use crate::core_modules::capture_store::{CaptureStore, DeleteReport, LayerSummary, RecordOrder};
use crate::core_modules::dataset::{LayerId, Split, SplitMode};
use crate::core_modules::labels::LabelBox;
use crate::core_modules::layer_bundler::{BundleReport, LayerBundler, SheetLayout};
use crate::error::{CaptureError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;

/// How long `reset_capture` waits for a cancelled worker before giving up on it.
pub const RESET_GRACE: Duration = Duration::from_secs(2);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartResponse {
    pub status: StartStatus,
    pub layer_current: u32,
    pub layer_total: u32,
}

/// Point-in-time view of the session, as polled by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub images: Vec<String>,
    pub running: bool,
    pub stopped: bool,
    pub error: Option<String>,
    pub mode: SplitMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetStatus {
    ResetDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LayerCounter {
    pub current: u32,
    pub total: u32,
}

/// One browsable capture with its public URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryItem {
    pub id: i64,
    pub layer: LayerId,
    pub split: Split,
    pub ts: DateTime<Utc>,
    pub url: String,
    pub boxes: Vec<LabelBox>,
}

/// Cloneable handle to the capture core.
#[derive(Debug, Clone)]
pub struct SessionGateway {
    shared: Arc<SessionShared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionGateway {
    /// Opens the store and prepares an idle session. Does not touch the dataset.
    pub fn new(config: CaptureConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| CaptureError::Configuration(e.to_string()))?;
        std::fs::create_dir_all(&config.archive_root)
            .map_err(|e| CaptureError::io(&config.archive_root, e))?;

        let store = CaptureStore::open(&config.db_path, &config.archive_root, &config.dataset_root)?;
        let bundler = LayerBundler::new(store.clone(), SheetLayout::from_config(&config));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::info!(
            dataset = ?config.dataset_root,
            archive = ?config.archive_root,
            mode = %config.split_mode,
            slots = config.total_slots,
            "capture gateway ready"
        );

        Ok(Self {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::new(config.layer_total)),
                cancel: Notify::new(),
                events,
                config,
                store,
                bundler,
            }),
            worker: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &CaptureStore {
        &self.shared.store
    }

    /// Starts a session for the next layer unless one is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<StartResponse> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CaptureError::Configuration(format!("start needs a tokio runtime: {e}")))?;

        // Held until the new handle is stored, so a later start can never be
        // overwritten by an earlier one. Lock order: worker, then state.
        let mut worker = self.lock_worker();
        let (begun, layer_current, layer_total) = {
            let mut state = self.shared.lock_state();
            let begun = state.begin();
            (begun, state.layer_current, state.layer_total)
        };

        let Some((layer, generation)) = begun else {
            tracing::debug!("start ignored, session already running");
            return Ok(StartResponse {
                status: StartStatus::AlreadyRunning,
                layer_current,
                layer_total,
            });
        };

        self.shared.publish(SessionEvent::Started { layer, generation });
        let shared = Arc::clone(&self.shared);
        let handle = runtime.spawn(async move {
            capture_session::run_session(shared, layer, generation).await;
        });
        *worker = Some(handle);
        drop(worker);

        Ok(StartResponse {
            status: StartStatus::Started,
            layer_current,
            layer_total,
        })
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.shared.lock_state();
        SessionStatus {
            images: state.images.clone(),
            running: state.running,
            stopped: state.stopped,
            error: state.error.clone(),
            mode: self.shared.config.split_mode,
        }
    }

    /// Asks the running worker to stop at its next iteration boundary. The
    /// session keeps its images and ends as `stopped` with no error.
    pub fn cancel(&self) {
        let mut state = self.shared.lock_state();
        if state.running {
            state.cancel_requested = true;
            tracing::info!(layer = state.layer_current, "cancel requested");
        }
        drop(state);
        self.shared.cancel.notify_waiters();
    }

    /// Cancels, waits up to `RESET_GRACE` for the worker, then clears the
    /// session. Stored records and bundles are untouched.
    pub async fn reset_capture(&self) -> ResetResponse {
        self.cancel();
        let handle = self.lock_worker().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(RESET_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "capture worker ended abnormally"),
                Err(_) => tracing::warn!("capture worker still busy after grace period, detaching it"),
            }
        }
        self.shared.lock_state().clear();
        tracing::info!("capture session reset");
        ResetResponse {
            status: ResetStatus::ResetDone,
        }
    }

    pub fn reset_layers(&self) -> LayerCounter {
        let mut state = self.shared.lock_state();
        state.layer_current = 0;
        tracing::info!("layer counter reset");
        LayerCounter {
            current: state.layer_current,
            total: state.layer_total,
        }
    }

    pub fn layers(&self) -> LayerCounter {
        let state = self.shared.lock_state();
        LayerCounter {
            current: state.layer_current,
            total: state.layer_total,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Waits for the current worker, bundling included, to finish.
    pub async fn wait_for_worker(&self) -> Result<()> {
        let handle = self.lock_worker().take();
        match handle {
            Some(handle) => Ok(handle.await?),
            None => Ok(()),
        }
    }

    /// Captures of one layer (or of every layer), newest first, with URLs
    /// under the configured prefix.
    pub async fn library(&self, layer: Option<LayerId>, limit: Option<usize>) -> Result<Vec<LibraryItem>> {
        let store = self.shared.store.clone();
        let records = tokio::task::spawn_blocking(move || {
            store.query_by_layer(layer, RecordOrder::NewestFirst, limit)
        })
        .await??;

        let prefix = &self.shared.config.url_prefix;
        let archive_root = self.shared.store.archive_root();
        Ok(records
            .into_iter()
            .filter_map(|record| {
                let Some(url) = public_url(prefix, archive_root, &record.path) else {
                    tracing::debug!(id = record.id, path = ?record.path, "record outside the archive, not listed");
                    return None;
                };
                Some(LibraryItem {
                    id: record.id,
                    layer: record.layer,
                    split: record.split,
                    ts: record.ts,
                    url,
                    boxes: record.boxes,
                })
            })
            .collect())
    }

    /// Layers that have records, with their counts.
    pub async fn layer_summaries(&self) -> Result<Vec<LayerSummary>> {
        let store = self.shared.store.clone();
        tokio::task::spawn_blocking(move || store.layers()).await?
    }

    /// Deletes a layer's records. With `delete_files`, also removes the
    /// archived copies and the layer's bundle folder. Dataset files are never
    /// touched.
    pub async fn delete_layer(&self, layer: LayerId, delete_files: bool) -> Result<DeleteReport> {
        let store = self.shared.store.clone();
        let bundle_dir = self.shared.bundler.bundle_dir(layer);
        tokio::task::spawn_blocking(move || -> Result<DeleteReport> {
            let report = store.delete_layer(layer, delete_files)?;
            if delete_files && layer.is_valid() && store.is_managed_path(&bundle_dir) {
                match std::fs::remove_dir_all(&bundle_dir) {
                    Ok(()) => tracing::info!(layer = %layer, dir = ?bundle_dir, "removed layer bundle"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CaptureError::io(&bundle_dir, e)),
                }
            }
            Ok(report)
        })
        .await?
    }

    /// Regenerates the bundle of `layer` from its stored records.
    pub async fn rebundle(&self, layer: LayerId) -> Result<BundleReport> {
        if !layer.is_valid() {
            return Err(CaptureError::Configuration(format!("layer {layer} does not exist")));
        }
        let bundler = self.shared.bundler.clone();
        tokio::task::spawn_blocking(move || bundler.bundle(layer)).await?
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `<prefix>/<path relative to archive>`, `/`-separated.
pub fn public_url(prefix: &str, archive_root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(archive_root).ok()?.to_path_buf();
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("{}/{}", prefix.trim_end_matches('/'), parts.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_are_built_from_the_archive_relative_path() {
        let archive = Path::new("static/capturas");
        let path = archive.join("captures").join("layer_2").join("x.jpg");
        assert_eq!(
            public_url("/static/capturas/", archive, &path).as_deref(),
            Some("/static/capturas/captures/layer_2/x.jpg")
        );
        assert_eq!(public_url("/s", archive, Path::new("elsewhere/x.jpg")), None);
    }

    #[test]
    fn responses_serialize_with_dashboard_field_names() {
        let start = StartResponse {
            status: StartStatus::AlreadyRunning,
            layer_current: 3,
            layer_total: 32,
        };
        let json = serde_json::to_value(start).unwrap();
        assert_eq!(json["status"], "already_running");
        assert_eq!(json["layer_current"], 3);

        let reset = serde_json::to_value(ResetResponse { status: ResetStatus::ResetDone }).unwrap();
        assert_eq!(reset["status"], "reset_done");
    }

    #[test]
    fn start_outside_a_runtime_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptureConfig {
            dataset_root: dir.path().join("dataset"),
            archive_root: dir.path().join("archive"),
            db_path: dir.path().join("c.db"),
            ..CaptureConfig::default()
        };
        let gateway = SessionGateway::new(config).unwrap();
        assert_eq!(gateway.config().total_slots, 10);
        assert_eq!(gateway.store().archive_root(), dir.path().join("archive"));

        assert!(matches!(gateway.start(), Err(CaptureError::Configuration(_))));
        assert!(!gateway.status().running);
        assert_eq!(gateway.layers().current, 0);
    }
}
