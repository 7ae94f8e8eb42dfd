use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::engine::RenderingEngine;
use crate::error::{ViewerError, ViewerResult};
use crate::jobs::{Job, JobMode, JobPoll};
use crate::notify::Notifications;
use crate::series::SeriesId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A database layer never goes back to `Local`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOrigin {
    Local,
    Database { record_id: String },
}

/// Painted labelmap for one slice, run-length encoded by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelmapSnapshot {
    pub slice_index: usize,
    pub image_ref: String,
    pub labelmap: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationLayer {
    pub id: LayerId,
    pub series_id: SeriesId,
    pub origin: LayerOrigin,
    pub name: String,
    pub notes: Option<String>,
    /// Slice the layer was started on.
    pub frame: usize,
    pub visible: bool,
    /// Ordered by slice index, at most one per slice.
    pub snapshots: Vec<LabelmapSnapshot>,
    pub segmentator_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub status: Option<String>,
    pub color_code: Option<String>,
    /// Bumped by every recorded snapshot.
    snapshot_revision: u64,
    /// Highest revision the backend has acknowledged.
    synced_revision: u64,
    /// Set after a failed snapshot upload; the next stroke or an explicit
    /// sync clears it.
    sync_paused: bool,
}

impl SegmentationLayer {
    pub fn record_id(&self) -> Option<&str> {
        match &self.origin {
            LayerOrigin::Database { record_id } => Some(record_id),
            LayerOrigin::Local => None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.origin, LayerOrigin::Database { .. })
    }

    /// Painted since the backend last acknowledged the snapshots.
    pub fn has_unsynced_snapshots(&self) -> bool {
        self.snapshot_revision != self.synced_revision
    }
}

/// Segmentation record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRecord {
    pub id: String,
    pub series_id: String,
    pub name: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub frame: usize,
    #[serde(default)]
    pub snapshots: Vec<LabelmapSnapshot>,
    #[serde(default)]
    pub segmentator_id: Option<String>,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub color_code: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLayer {
    pub name: String,
    pub notes: Option<String>,
    pub frame: usize,
    pub snapshots: Vec<LabelmapSnapshot>,
    pub segmentator_id: Option<String>,
    pub status: Option<String>,
    pub color_code: Option<String>,
}

impl NewLayer {
    fn from_layer(layer: &SegmentationLayer) -> Self {
        Self {
            name: layer.name.clone(),
            notes: layer.notes.clone(),
            frame: layer.frame,
            snapshots: layer.snapshots.clone(),
            segmentator_id: layer.segmentator_id.clone(),
            status: layer.status.clone(),
            color_code: layer.color_code.clone(),
        }
    }
}

/// Partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<Vec<LabelmapSnapshot>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteToken(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePrompt {
    pub layer_id: LayerId,
    pub token: DeleteToken,
    pub title: String,
    pub message: String,
    pub persisted: bool,
}

struct PendingSave {
    snapshot_revision: u64,
    job: Job<Result<LayerRecord>>,
}

struct PendingUpdate {
    id: LayerId,
    /// Revision of the snapshots carried by the update, if any.
    snapshot_revision: Option<u64>,
    job: Job<Result<LayerRecord>>,
}

struct PendingDelete {
    position: usize,
    layer: SegmentationLayer,
    was_active: bool,
    job: Job<Result<()>>,
}

pub struct LayerManager {
    backend: Arc<dyn Backend>,
    mode: JobMode,
    layers: Vec<SegmentationLayer>,
    next_id: u64,
    next_token: u64,
    active: Option<LayerId>,
    global_visible: bool,
    prompts: HashMap<LayerId, DeleteToken>,
    saves: HashMap<LayerId, PendingSave>,
    updates: Vec<PendingUpdate>,
    deletes: Vec<PendingDelete>,
    loads: HashMap<SeriesId, Job<Result<Vec<LayerRecord>>>>,
}

impl LayerManager {
    pub fn new(backend: Arc<dyn Backend>, mode: JobMode) -> Self {
        Self {
            backend,
            mode,
            layers: Vec::new(),
            next_id: 1,
            next_token: 1,
            active: None,
            global_visible: true,
            prompts: HashMap::new(),
            saves: HashMap::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
            loads: HashMap::new(),
        }
    }

    pub fn layers(&self) -> &[SegmentationLayer] {
        &self.layers
    }

    pub fn layers_for<'a>(
        &'a self,
        series_id: &'a SeriesId,
    ) -> impl Iterator<Item = &'a SegmentationLayer> + 'a {
        self.layers
            .iter()
            .filter(move |layer| &layer.series_id == series_id)
    }

    pub fn layer(&self, id: LayerId) -> Option<&SegmentationLayer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    fn layer_mut(&mut self, id: LayerId) -> ViewerResult<&mut SegmentationLayer> {
        self.layers
            .iter_mut()
            .find(|layer| layer.id == id)
            .ok_or(ViewerError::UnknownLayer(id.0))
    }

    pub fn active(&self) -> Option<&SegmentationLayer> {
        self.active.and_then(|id| self.layer(id))
    }

    pub fn select(&mut self, id: LayerId) -> ViewerResult<()> {
        self.layer_mut(id)?;
        self.active = Some(id);
        Ok(())
    }

    pub fn global_visible(&self) -> bool {
        self.global_visible
    }

    /// Global switch AND the layer's own flag.
    pub fn effective_visibility(&self, id: LayerId) -> bool {
        self.global_visible && self.layer(id).is_some_and(|layer| layer.visible)
    }

    pub fn is_saving(&self, id: LayerId) -> bool {
        self.saves.contains_key(&id)
    }

    pub fn has_pending_work(&self) -> bool {
        !self.saves.is_empty()
            || !self.updates.is_empty()
            || !self.deletes.is_empty()
            || !self.loads.is_empty()
    }

    pub fn create_layer(
        &mut self,
        engine: &mut dyn RenderingEngine,
        series_id: SeriesId,
        frame: usize,
    ) -> LayerId {
        let id = self.allocate_id();
        let ordinal = self.layers_for(&series_id).count() + 1;
        self.layers.push(SegmentationLayer {
            id,
            series_id,
            origin: LayerOrigin::Local,
            name: format!("Layer {ordinal}"),
            notes: None,
            frame,
            visible: true,
            snapshots: Vec::new(),
            segmentator_id: None,
            reviewer_id: None,
            status: None,
            color_code: None,
            snapshot_revision: 0,
            synced_revision: 0,
            sync_paused: false,
        });
        engine.attach_labelmap(id.0, &[]);
        engine.set_labelmap_visible(id.0, self.effective_visibility(id));
        self.active = Some(id);
        log::info!("created local segmentation layer {id}");
        id
    }

    pub fn set_visible(
        &mut self,
        engine: &mut dyn RenderingEngine,
        id: LayerId,
        visible: bool,
    ) -> ViewerResult<()> {
        self.layer_mut(id)?.visible = visible;
        engine.set_labelmap_visible(id.0, self.effective_visibility(id));
        Ok(())
    }

    pub fn toggle_global_visibility(&mut self, engine: &mut dyn RenderingEngine) -> bool {
        self.global_visible = !self.global_visible;
        for layer in &self.layers {
            engine.set_labelmap_visible(layer.id.0, self.global_visible && layer.visible);
        }
        self.global_visible
    }

    /// Keeps one snapshot per slice, ordered by slice index.
    pub fn record_snapshot(&mut self, id: LayerId, snapshot: LabelmapSnapshot) -> ViewerResult<()> {
        let layer = self.layer_mut(id)?;
        match layer
            .snapshots
            .binary_search_by_key(&snapshot.slice_index, |existing| existing.slice_index)
        {
            Ok(index) => layer.snapshots[index] = snapshot,
            Err(index) => layer.snapshots.insert(index, snapshot),
        }
        layer.snapshot_revision += 1;
        layer.sync_paused = false;
        Ok(())
    }

    pub fn is_syncing_snapshots(&self, id: LayerId) -> bool {
        self.updates
            .iter()
            .any(|update| update.id == id && update.snapshot_revision.is_some())
    }

    /// Uploads the snapshots of a saved layer if the backend is behind.
    /// Returns whether an upload was started.
    pub fn sync_snapshots(&mut self, id: LayerId) -> ViewerResult<bool> {
        self.layer_mut(id)?.sync_paused = false;
        Ok(self.start_snapshot_sync(id))
    }

    fn start_snapshot_sync(&mut self, id: LayerId) -> bool {
        if self.saves.contains_key(&id) || self.is_syncing_snapshots(id) {
            return false;
        }
        let Some(layer) = self.layer(id) else {
            return false;
        };
        let Some(record_id) = layer.record_id().map(str::to_string) else {
            return false;
        };
        if !layer.has_unsynced_snapshots() || layer.sync_paused {
            return false;
        }
        let revision = layer.snapshot_revision;
        let metadata = LayerMetadata {
            snapshots: Some(layer.snapshots.clone()),
            ..LayerMetadata::default()
        };
        let backend = Arc::clone(&self.backend);
        let job = Job::spawn(self.mode, format!("sync-layer-{}", id.0), move |_| {
            backend.update_layer(&record_id, &metadata)
        });
        self.updates.push(PendingUpdate {
            id,
            snapshot_revision: Some(revision),
            job,
        });
        true
    }

    /// Persists a local layer. The origin flips to database when the job completes.
    pub fn save(&mut self, id: LayerId) -> ViewerResult<()> {
        if self.saves.contains_key(&id) {
            return Err(ViewerError::InvalidTransition(format!(
                "layer {id} is already being saved"
            )));
        }
        let layer = self
            .layer(id)
            .ok_or(ViewerError::UnknownLayer(id.0))?;
        if let Some(record_id) = layer.record_id() {
            return Err(ViewerError::InvalidTransition(format!(
                "layer {id} is already persisted as {record_id}"
            )));
        }
        let backend = Arc::clone(&self.backend);
        let series_id = layer.series_id.clone();
        let snapshot_revision = layer.snapshot_revision;
        let body = NewLayer::from_layer(layer);
        let job = Job::spawn(self.mode, format!("save-layer-{}", id.0), move |_| {
            backend.create_layer(&series_id, &body)
        });
        self.saves.insert(
            id,
            PendingSave {
                snapshot_revision,
                job,
            },
        );
        Ok(())
    }

    /// Applies locally right away; persisted layers also get a backend update.
    pub fn update_metadata(
        &mut self,
        id: LayerId,
        mut metadata: LayerMetadata,
    ) -> ViewerResult<()> {
        let layer = self.layer_mut(id)?;
        if let Some(name) = metadata.name.as_ref() {
            layer.name = name.clone();
        }
        if metadata.notes.is_some() {
            layer.notes = metadata.notes.clone();
        }
        if metadata.status.is_some() {
            layer.status = metadata.status.clone();
        }
        if metadata.color_code.is_some() {
            layer.color_code = metadata.color_code.clone();
        }
        if metadata.reviewer_id.is_some() {
            layer.reviewer_id = metadata.reviewer_id.clone();
        }
        let Some(record_id) = layer.record_id().map(str::to_string) else {
            return Ok(());
        };
        let snapshot_revision = layer.has_unsynced_snapshots().then(|| {
            metadata.snapshots = Some(layer.snapshots.clone());
            layer.snapshot_revision
        });

        let backend = Arc::clone(&self.backend);
        let job = Job::spawn(self.mode, format!("update-layer-{}", id.0), move |_| {
            backend.update_layer(&record_id, &metadata)
        });
        self.updates.push(PendingUpdate {
            id,
            snapshot_revision,
            job,
        });
        Ok(())
    }

    pub fn delete_prompt(&mut self, id: LayerId) -> ViewerResult<DeletePrompt> {
        let layer = self
            .layer(id)
            .ok_or(ViewerError::UnknownLayer(id.0))?;
        let persisted = layer.is_persisted();
        let (title, message) = if persisted {
            (
                "Delete saved layer".to_string(),
                format!(
                    "\"{}\" is stored in the database. Deleting it removes it for every \
                     user and cannot be undone.",
                    layer.name
                ),
            )
        } else {
            (
                "Discard layer".to_string(),
                format!("Discard unsaved layer \"{}\"?", layer.name),
            )
        };
        let token = DeleteToken(self.next_token);
        self.next_token += 1;
        self.prompts.insert(id, token);
        Ok(DeletePrompt {
            layer_id: id,
            token,
            title,
            message,
            persisted,
        })
    }

    pub fn cancel_delete(&mut self, id: LayerId) {
        self.prompts.remove(&id);
    }

    /// Removes a layer after the user confirmed `delete_prompt`. Database
    /// layers get exactly one backend delete and come back if it fails.
    pub fn delete(
        &mut self,
        engine: &mut dyn RenderingEngine,
        id: LayerId,
        token: DeleteToken,
    ) -> ViewerResult<()> {
        if self.prompts.get(&id) != Some(&token) {
            return Err(ViewerError::InvalidTransition(format!(
                "delete of layer {id} was not confirmed"
            )));
        }
        if self.saves.contains_key(&id) {
            return Err(ViewerError::InvalidTransition(format!(
                "layer {id} cannot be deleted while it is being saved"
            )));
        }
        let position = self
            .layers
            .iter()
            .position(|layer| layer.id == id)
            .ok_or(ViewerError::UnknownLayer(id.0))?;
        self.prompts.remove(&id);
        let layer = self.layers.remove(position);
        let was_active = self.active == Some(id);
        if was_active {
            self.active = self
                .layers_for(&layer.series_id)
                .last()
                .map(|remaining| remaining.id);
        }

        let Some(record_id) = layer.record_id().map(str::to_string) else {
            engine.remove_labelmap(id.0);
            log::info!("discarded local segmentation layer {id}");
            return Ok(());
        };
        engine.set_labelmap_visible(id.0, false);
        let backend = Arc::clone(&self.backend);
        let job = Job::spawn(self.mode, format!("delete-layer-{}", id.0), move |_| {
            backend.delete_layer(&record_id)
        });
        self.deletes.push(PendingDelete {
            position,
            layer,
            was_active,
            job,
        });
        Ok(())
    }

    /// Fetches persisted layers for a series. Layers already present are kept.
    pub fn load_from_backend(&mut self, series_id: &SeriesId) {
        if self.loads.contains_key(series_id) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let target = series_id.clone();
        let job = Job::spawn(self.mode, format!("load-layers-{series_id}"), move |_| {
            backend.list_layers(&target)
        });
        self.loads.insert(series_id.clone(), job);
    }

    pub fn cancel_all(&mut self) {
        for job in self.loads.values_mut() {
            job.cancel();
        }
        self.loads.clear();
        for update in self.updates.iter_mut() {
            update.job.cancel();
        }
        self.updates.clear();
    }

    /// Drains finished jobs. Returns true while work is still in flight.
    pub fn poll(
        &mut self,
        engine: &mut dyn RenderingEngine,
        notifications: &mut Notifications,
        now: Instant,
    ) -> bool {
        self.poll_saves(notifications, now);
        self.poll_updates(notifications, now);
        self.poll_deletes(engine, notifications, now);
        self.poll_loads(engine);
        let behind = self
            .layers
            .iter()
            .filter(|layer| layer.is_persisted() && layer.has_unsynced_snapshots())
            .map(|layer| layer.id)
            .collect::<Vec<_>>();
        for id in behind {
            self.start_snapshot_sync(id);
        }
        self.has_pending_work()
    }

    fn poll_saves(&mut self, notifications: &mut Notifications, now: Instant) {
        let saves = std::mem::take(&mut self.saves);
        for (id, mut save) in saves {
            match save.job.poll() {
                JobPoll::Pending => {
                    self.saves.insert(id, save);
                }
                JobPoll::Ready(Ok(record)) => match self.layer_mut(id) {
                    Ok(layer) => {
                        log::info!("layer {id} saved as {}", record.id);
                        layer.origin = LayerOrigin::Database {
                            record_id: record.id,
                        };
                        layer.synced_revision = layer.synced_revision.max(save.snapshot_revision);
                        notifications.info(format!("Saved \"{}\"", layer.name), now);
                    }
                    Err(_) => {
                        log::warn!("layer {id} vanished before save of {} completed", record.id)
                    }
                },
                JobPoll::Ready(Err(err)) => {
                    notifications.report(&ViewerError::persistence("Saving layer", &err), now);
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    fn poll_updates(&mut self, notifications: &mut Notifications, now: Instant) {
        let updates = std::mem::take(&mut self.updates);
        for mut update in updates {
            let id = update.id;
            match update.job.poll() {
                JobPoll::Pending => self.updates.push(update),
                JobPoll::Ready(Ok(record)) => {
                    log::debug!("layer {id} updated ({})", record.id);
                    if let (Some(revision), Ok(layer)) =
                        (update.snapshot_revision, self.layer_mut(id))
                    {
                        layer.synced_revision = layer.synced_revision.max(revision);
                    }
                }
                JobPoll::Ready(Err(err)) => {
                    notifications.report(&ViewerError::persistence("Updating layer", &err), now);
                    if update.snapshot_revision.is_some() {
                        if let Ok(layer) = self.layer_mut(id) {
                            layer.sync_paused = true;
                        }
                    }
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    fn poll_deletes(
        &mut self,
        engine: &mut dyn RenderingEngine,
        notifications: &mut Notifications,
        now: Instant,
    ) {
        let deletes = std::mem::take(&mut self.deletes);
        for mut pending in deletes {
            match pending.job.poll() {
                JobPoll::Pending => self.deletes.push(pending),
                JobPoll::Ready(Ok(())) => {
                    engine.remove_labelmap(pending.layer.id.0);
                    log::info!("deleted segmentation layer {}", pending.layer.id);
                }
                JobPoll::Ready(Err(err)) => {
                    notifications.report(&ViewerError::persistence("Deleting layer", &err), now);
                    self.restore(engine, pending);
                }
                JobPoll::Cancelled | JobPoll::Disconnected => self.restore(engine, pending),
            }
        }
    }

    fn restore(&mut self, engine: &mut dyn RenderingEngine, pending: PendingDelete) {
        let id = pending.layer.id;
        let position = pending.position.min(self.layers.len());
        self.layers.insert(position, pending.layer);
        if pending.was_active {
            self.active = Some(id);
        }
        engine.set_labelmap_visible(id.0, self.effective_visibility(id));
    }

    fn poll_loads(&mut self, engine: &mut dyn RenderingEngine) {
        let loads = std::mem::take(&mut self.loads);
        for (series_id, mut job) in loads {
            match job.poll() {
                JobPoll::Pending => {
                    self.loads.insert(series_id, job);
                }
                JobPoll::Ready(Ok(records)) => {
                    let added = self.adopt_records(engine, &series_id, records);
                    log::info!("loaded {added} segmentation layer(s) for series {series_id}");
                }
                JobPoll::Ready(Err(err)) => {
                    log::warn!("could not load segmentation layers for {series_id}: {err:#}");
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    fn adopt_records(
        &mut self,
        engine: &mut dyn RenderingEngine,
        series_id: &SeriesId,
        records: Vec<LayerRecord>,
    ) -> usize {
        let mut added = 0;
        for record in records {
            let known = self
                .layers
                .iter()
                .any(|layer| layer.record_id() == Some(record.id.as_str()));
            if known {
                continue;
            }
            let id = self.allocate_id();
            let mut snapshots = record.snapshots;
            snapshots.sort_by_key(|snapshot| snapshot.slice_index);
            snapshots.dedup_by_key(|snapshot| snapshot.slice_index);
            engine.attach_labelmap(id.0, &snapshots);
            self.layers.push(SegmentationLayer {
                id,
                series_id: series_id.clone(),
                origin: LayerOrigin::Database {
                    record_id: record.id,
                },
                name: record.name,
                notes: record.notes,
                frame: record.frame,
                visible: true,
                snapshots,
                segmentator_id: record.segmentator_id,
                reviewer_id: record.reviewer_id,
                status: record.status,
                color_code: record.color_code,
                snapshot_revision: 0,
                synced_revision: 0,
                sync_paused: false,
            });
            engine.set_labelmap_visible(id.0, self.effective_visibility(id));
            added += 1;
        }
        added
    }

    fn allocate_id(&mut self) -> LayerId {
        let id = LayerId(self.next_id);
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::engine::testing::FakeEngine;

    fn series() -> SeriesId {
        SeriesId::new("series-1")
    }

    fn manager(backend: &Arc<FakeBackend>) -> LayerManager {
        let backend: Arc<dyn Backend> = backend.clone();
        LayerManager::new(backend, JobMode::Inline)
    }

    fn poll(layers: &mut LayerManager, engine: &mut FakeEngine) -> Notifications {
        let mut notifications = Notifications::default();
        layers.poll(engine, &mut notifications, Instant::now());
        notifications
    }

    #[test]
    fn new_layer_is_local_visible_and_selected() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::with_viewports(&[0]);
        let mut layers = manager(&backend);

        let first = layers.create_layer(&mut engine, series(), 3);
        let second = layers.create_layer(&mut engine, series(), 3);
        assert_ne!(first, second);
        let active = layers.active().expect("new layer is selected");
        assert_eq!(active.id, second);
        assert_eq!(active.name, "Layer 2");
        assert_eq!(active.origin, LayerOrigin::Local);
        assert!(layers.effective_visibility(second));
        assert!(engine.labelmaps.contains_key(&second.0));
        assert_eq!(backend.total_calls(), 0);
    }

    #[test]
    fn effective_visibility_is_global_and_layer() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        for (global, own, expected) in [
            (true, true, true),
            (true, false, false),
            (false, true, false),
            (false, false, false),
        ] {
            if layers.global_visible() != global {
                layers.toggle_global_visibility(&mut engine);
            }
            layers.set_visible(&mut engine, id, own).expect("known layer");
            assert_eq!(layers.effective_visibility(id), expected);
            assert_eq!(engine.labelmap_visibility.get(&id.0), Some(&expected));
        }
    }

    #[test]
    fn save_moves_local_layer_to_database_once() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        layers.save(id).expect("local layer saves");
        assert!(matches!(layers.save(id), Err(ViewerError::InvalidTransition(_))));
        let notifications = poll(&mut layers, &mut engine);
        assert_eq!(notifications.len(), 1);

        let layer = layers.layer(id).expect("layer kept");
        assert_eq!(layer.record_id(), Some("seg-1"));
        assert!(matches!(layers.save(id), Err(ViewerError::InvalidTransition(_))));
        assert_eq!(backend.calls("create_layer"), 1);
    }

    #[test]
    fn failed_save_keeps_layer_local_and_notifies() {
        let backend = Arc::new(FakeBackend::failing_writes());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        layers.save(id).expect("save starts");
        let notifications = poll(&mut layers, &mut engine);
        assert_eq!(layers.layer(id).map(|l| l.is_persisted()), Some(false));
        let toast = notifications.iter().next().expect("error toast");
        assert!(toast.message.contains("Saving layer failed"));
        assert!(layers.save(id).is_ok());
    }

    #[test]
    fn delete_requires_the_prompt_token() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        let stale = layers.delete_prompt(id).expect("prompt").token;
        let prompt = layers.delete_prompt(id).expect("prompt");
        assert!(!prompt.persisted);
        assert!(layers.delete(&mut engine, id, stale).is_err());
        assert!(layers.layer(id).is_some());

        layers.delete(&mut engine, id, prompt.token).expect("confirmed");
        assert!(layers.layer(id).is_none());
    }

    #[test]
    fn local_delete_never_touches_backend() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        let prompt = layers.delete_prompt(id).expect("prompt");
        layers.delete(&mut engine, id, prompt.token).expect("deleted");
        poll(&mut layers, &mut engine);
        assert_eq!(backend.total_calls(), 0);
        assert_eq!(engine.removed_labelmaps, vec![id.0]);
        assert!(layers.active().is_none());
    }

    #[test]
    fn persisted_delete_issues_exactly_one_backend_delete() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);
        layers.save(id).expect("save");
        poll(&mut layers, &mut engine);

        let prompt = layers.delete_prompt(id).expect("prompt");
        assert!(prompt.persisted);
        assert!(prompt.message.contains("cannot be undone"));
        layers.delete(&mut engine, id, prompt.token).expect("deleted");
        assert!(layers.delete(&mut engine, id, prompt.token).is_err());
        poll(&mut layers, &mut engine);
        poll(&mut layers, &mut engine);

        assert_eq!(backend.calls("delete_layer"), 1);
        assert!(layers.layer(id).is_none());
        assert_eq!(engine.removed_labelmaps, vec![id.0]);
    }

    #[test]
    fn failed_persisted_delete_restores_layer() {
        let backend = Arc::new(FakeBackend::failing_writes());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        layers.adopt_records(
            &mut engine,
            &series(),
            vec![LayerRecord {
                id: "seg-9".to_string(),
                series_id: "series-1".to_string(),
                name: "Liver".to_string(),
                notes: None,
                frame: 2,
                snapshots: Vec::new(),
                segmentator_id: None,
                reviewer_id: None,
                status: None,
                color_code: None,
                created_at: None,
                updated_at: None,
            }],
        );
        let id = layers.layers()[0].id;
        let prompt = layers.delete_prompt(id).expect("prompt");
        layers.delete(&mut engine, id, prompt.token).expect("delete starts");
        assert!(layers.layer(id).is_none());

        let notifications = poll(&mut layers, &mut engine);
        assert_eq!(layers.layer(id).map(|l| l.name.as_str()), Some("Liver"));
        assert_eq!(notifications.len(), 1);
        assert!(engine.removed_labelmaps.is_empty());
        assert_eq!(engine.labelmap_visibility.get(&id.0), Some(&true));
    }

    #[test]
    fn load_from_backend_adds_each_record_once() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut writer = manager(&backend);
        let id = writer.create_layer(&mut engine, series(), 0);
        writer.save(id).expect("save");
        poll(&mut writer, &mut engine);

        let mut layers = manager(&backend);
        layers.load_from_backend(&series());
        poll(&mut layers, &mut engine);
        layers.load_from_backend(&series());
        poll(&mut layers, &mut engine);

        assert_eq!(layers.layers().len(), 1);
        assert!(layers.layers()[0].is_persisted());
        assert_eq!(backend.calls("list_layers"), 2);
    }

    #[test]
    fn metadata_updates_reach_backend_only_for_persisted_layers() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        let rename = LayerMetadata {
            name: Some("Lesion".to_string()),
            ..LayerMetadata::default()
        };
        layers.update_metadata(id, rename.clone()).expect("local edit");
        assert_eq!(layers.layer(id).map(|l| l.name.as_str()), Some("Lesion"));
        assert_eq!(backend.calls("update_layer"), 0);

        layers.save(id).expect("save");
        poll(&mut layers, &mut engine);
        layers.update_metadata(id, rename).expect("remote edit");
        poll(&mut layers, &mut engine);
        assert_eq!(backend.calls("update_layer"), 1);
    }

    fn painted(slice: usize) -> LabelmapSnapshot {
        LabelmapSnapshot {
            slice_index: slice,
            image_ref: format!("wadouri:{slice}.dcm"),
            labelmap: "2x2:1,3".to_string(),
        }
    }

    #[test]
    fn strokes_painted_while_saving_still_reach_backend() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);

        layers.save(id).expect("save starts");
        layers.record_snapshot(id, painted(3)).expect("known layer");
        assert_eq!(poll(&mut layers, &mut engine).len(), 1);
        assert!(layers.is_syncing_snapshots(id));

        layers.record_snapshot(id, painted(5)).expect("known layer");
        poll(&mut layers, &mut engine);
        poll(&mut layers, &mut engine);

        let stored = backend.layers.lock().expect("lock")[0].snapshots.clone();
        assert_eq!(
            stored.iter().map(|s| s.slice_index).collect::<Vec<_>>(),
            vec![3, 5]
        );
        assert_eq!(backend.calls("update_layer"), 2);
        assert!(!layers.layer(id).expect("layer").has_unsynced_snapshots());
        assert!(!layers.has_pending_work());
    }

    #[test]
    fn failed_snapshot_upload_waits_for_next_stroke_or_explicit_sync() {
        let backend = Arc::new(FakeBackend::failing_writes());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        layers.adopt_records(
            &mut engine,
            &series(),
            vec![LayerRecord {
                id: "seg-3".to_string(),
                series_id: "series-1".to_string(),
                name: "Kidney".to_string(),
                notes: None,
                frame: 0,
                snapshots: Vec::new(),
                segmentator_id: None,
                reviewer_id: None,
                status: None,
                color_code: None,
                created_at: None,
                updated_at: None,
            }],
        );
        let id = layers.layers()[0].id;

        layers.record_snapshot(id, painted(1)).expect("known layer");
        poll(&mut layers, &mut engine);
        let notifications = poll(&mut layers, &mut engine);
        assert_eq!(notifications.len(), 1);
        poll(&mut layers, &mut engine);
        assert_eq!(backend.calls("update_layer"), 1);
        assert!(layers.layer(id).expect("layer").has_unsynced_snapshots());

        assert!(layers.sync_snapshots(id).expect("known layer"));
        assert_eq!(backend.calls("update_layer"), 2);
        poll(&mut layers, &mut engine);

        layers.record_snapshot(id, painted(2)).expect("known layer");
        poll(&mut layers, &mut engine);
        assert_eq!(backend.calls("update_layer"), 3);
    }

    #[test]
    fn local_layers_never_upload_snapshots() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);
        layers.record_snapshot(id, painted(0)).expect("known layer");
        poll(&mut layers, &mut engine);
        assert!(!layers.sync_snapshots(id).expect("known layer"));
        assert_eq!(backend.total_calls(), 0);
    }

    #[test]
    fn snapshots_stay_ordered_one_per_slice() {
        let backend = Arc::new(FakeBackend::default());
        let mut engine = FakeEngine::default();
        let mut layers = manager(&backend);
        let id = layers.create_layer(&mut engine, series(), 0);
        for (slice, data) in [(4, "a"), (1, "b"), (4, "c")] {
            layers
                .record_snapshot(
                    id,
                    LabelmapSnapshot {
                        slice_index: slice,
                        image_ref: format!("wadouri:{slice}.dcm"),
                        labelmap: data.to_string(),
                    },
                )
                .expect("known layer");
        }
        let snapshots = &layers.layer(id).expect("layer").snapshots;
        assert_eq!(
            snapshots
                .iter()
                .map(|s| (s.slice_index, s.labelmap.as_str()))
                .collect::<Vec<_>>(),
            vec![(1, "b"), (4, "c")]
        );
    }
}
