use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::annotation::{
    AnnotationDetails, AnnotationPatch, AnnotationShape, NewAnnotation, PersistedAnnotation,
};
use crate::backend::Backend;
use crate::engine::{collect_shapes, require_element, RawAnnotation, RenderingEngine};
use crate::error::{ViewerError, ViewerResult};
use crate::hover::HoverTarget;
use crate::jobs::{Job, JobMode, JobPoll};
use crate::notify::Notifications;
use crate::registry::SeriesRegistry;
use crate::series::{parse_image_id, InstanceRecord, SeriesId};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Addresses one engine annotation on one viewport binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnnotationRef {
    pub viewport_index: usize,
    pub generation: u64,
    pub client_id: String,
}

impl From<&HoverTarget> for AnnotationRef {
    fn from(target: &HoverTarget) -> Self {
        Self {
            viewport_index: target.viewport_index,
            generation: target.generation,
            client_id: target.client_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Nothing more is coming for this target.
    Ready(AnnotationDetails),
    /// In-memory data now; an enriched copy arrives through `poll`.
    Pending(AnnotationDetails),
}

impl Resolution {
    pub fn details(&self) -> &AnnotationDetails {
        match self {
            Self::Ready(details) | Self::Pending(details) => details,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDetails {
    pub target: AnnotationRef,
    pub details: AnnotationDetails,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectedAnnotation {
    pub viewport_index: usize,
    pub shape: AnnotationShape,
    pub instance: Option<InstanceRecord>,
}

struct CacheEntry {
    record: PersistedAnnotation,
    fetched_at: Instant,
}

struct SeriesLookup {
    job: Job<Result<Vec<PersistedAnnotation>>>,
    waiters: Vec<AnnotationRef>,
}

struct PendingSave {
    viewport_index: usize,
    series_id: SeriesId,
    client_id: String,
    job: Job<Result<PersistedAnnotation>>,
}

struct PendingDelete {
    target: AnnotationRef,
    raw: RawAnnotation,
    job: Job<Result<()>>,
}

struct BindingLoad {
    viewport_index: usize,
    generation: u64,
    series_id: SeriesId,
    job: Job<Result<Vec<PersistedAnnotation>>>,
}

struct PendingUpdate {
    persisted_id: String,
    job: Job<Result<PersistedAnnotation>>,
}

/// Keeps engine-resident annotations and backend records in step.
pub struct AnnotationSyncBridge {
    backend: Arc<dyn Backend>,
    mode: JobMode,
    ttl: Duration,
    cache: HashMap<String, CacheEntry>,
    lookups: HashMap<SeriesId, SeriesLookup>,
    loads: Vec<BindingLoad>,
    saves: Vec<PendingSave>,
    deletes: Vec<PendingDelete>,
    updates: Vec<PendingUpdate>,
}

impl AnnotationSyncBridge {
    pub fn new(backend: Arc<dyn Backend>, mode: JobMode, ttl: Duration) -> Self {
        Self {
            backend,
            mode,
            ttl,
            cache: HashMap::new(),
            lookups: HashMap::new(),
            loads: Vec::new(),
            saves: Vec::new(),
            deletes: Vec::new(),
            updates: Vec::new(),
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.lookups.is_empty()
            || !self.loads.is_empty()
            || !self.saves.is_empty()
            || !self.deletes.is_empty()
            || !self.updates.is_empty()
    }

    pub fn is_saving(&self, client_id: &str) -> bool {
        self.saves.iter().any(|save| save.client_id == client_id)
    }

    fn cached(&self, persisted_id: &str, now: Instant) -> Option<&PersistedAnnotation> {
        self.cache
            .get(persisted_id)
            .filter(|entry| now.duration_since(entry.fetched_at) < self.ttl)
            .map(|entry| &entry.record)
    }

    fn current_shape(
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        target: &AnnotationRef,
    ) -> ViewerResult<AnnotationShape> {
        registry.ensure_current(target.viewport_index, target.generation)?;
        require_element(engine, target.viewport_index)?;
        engine
            .annotation(target.viewport_index, &target.client_id)
            .ok_or_else(|| {
                ViewerError::Resolution(format!(
                    "annotation {} is no longer on viewport {}",
                    target.client_id, target.viewport_index
                ))
            })?
            .to_shape()
    }

    /// Best available metadata for a shape. Drafts never touch the network.
    pub fn resolve(
        &mut self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        target: &AnnotationRef,
        now: Instant,
    ) -> ViewerResult<Resolution> {
        let shape = Self::current_shape(registry, engine, target)?;
        let mut details = AnnotationDetails::from_shape(&shape);
        let Some(persisted_id) = shape.persisted_id() else {
            return Ok(Resolution::Ready(details));
        };
        if let Some(record) = self.cached(persisted_id, now) {
            details.enrich(record);
            return Ok(Resolution::Ready(details));
        }

        let series_id = registry
            .binding(target.viewport_index)
            .map(|binding| binding.series.id.clone())
            .ok_or(ViewerError::ViewportOutOfRange(target.viewport_index))?;
        match self.lookups.get_mut(&series_id) {
            Some(lookup) => {
                if !lookup.waiters.contains(target) {
                    lookup.waiters.push(target.clone());
                }
            }
            None => {
                let backend = Arc::clone(&self.backend);
                let series = series_id.clone();
                let job = Job::spawn(
                    self.mode,
                    format!("annotations-{series_id}"),
                    move |_| backend.list_annotations(&series),
                );
                self.lookups.insert(
                    series_id,
                    SeriesLookup {
                        job,
                        waiters: vec![target.clone()],
                    },
                );
            }
        }
        Ok(Resolution::Pending(details))
    }

    /// Fetches the saved annotations of a freshly bound series so they are
    /// drawn on the viewport. Replaces any load still running for the viewport.
    pub fn load_for_binding(
        &mut self,
        viewport_index: usize,
        generation: u64,
        series_id: &SeriesId,
    ) {
        self.cancel_loads(viewport_index);
        let backend = Arc::clone(&self.backend);
        let series = series_id.clone();
        let job = Job::spawn(
            self.mode,
            format!("load-annotations-{series_id}-{viewport_index}"),
            move |_| backend.list_annotations(&series),
        );
        self.loads.push(BindingLoad {
            viewport_index,
            generation,
            series_id: series_id.clone(),
            job,
        });
    }

    fn cancel_loads(&mut self, viewport_index: usize) {
        for load in &mut self.loads {
            if load.viewport_index == viewport_index {
                load.job.cancel();
            }
        }
        self.loads.retain(|load| load.viewport_index != viewport_index);
    }

    /// Drains finished jobs. Returns enriched details for resolves that are
    /// still relevant; stale or vanished targets are dropped.
    pub fn poll(
        &mut self,
        registry: &SeriesRegistry,
        engine: &mut dyn RenderingEngine,
        notifications: &mut Notifications,
        now: Instant,
    ) -> Vec<ResolvedDetails> {
        let ttl = self.ttl;
        self.cache
            .retain(|_, entry| now.duration_since(entry.fetched_at) < ttl);

        self.poll_loads(registry, engine, now);
        let resolved = self.poll_lookups(registry, &*engine, now);
        self.poll_saves(engine, notifications, now);
        self.poll_deletes(registry, engine, notifications, now);
        self.poll_updates(notifications, now);
        resolved
    }

    fn poll_loads(
        &mut self,
        registry: &SeriesRegistry,
        engine: &mut dyn RenderingEngine,
        now: Instant,
    ) {
        let loads = std::mem::take(&mut self.loads);
        for mut load in loads {
            let records = match load.job.poll() {
                JobPoll::Pending => {
                    self.loads.push(load);
                    continue;
                }
                JobPoll::Ready(Ok(records)) => records,
                JobPoll::Ready(Err(err)) => {
                    let err = ViewerError::Resolution(format!("{}: {err:#}", load.series_id));
                    log::warn!("saved annotations not loaded: {err}");
                    continue;
                }
                JobPoll::Cancelled | JobPoll::Disconnected => continue,
            };
            let viewport_index = load.viewport_index;
            let current = registry.is_current(viewport_index, load.generation)
                && engine.element_generation(viewport_index) == Some(load.generation);
            if !current {
                log::debug!(
                    "dropping saved annotations of {} for rebound viewport {viewport_index}",
                    load.series_id
                );
                continue;
            }

            let mut known = engine
                .tool_types(viewport_index)
                .into_iter()
                .flat_map(|tool_type| engine.raw_annotations(viewport_index, tool_type))
                .filter_map(|raw| raw.correlation_id)
                .collect::<HashSet<_>>();
            let mut added = 0;
            for record in records {
                let raw = RawAnnotation::from_record(&record);
                self.cache.insert(
                    record.id.clone(),
                    CacheEntry {
                        record,
                        fetched_at: now,
                    },
                );
                if let Err(err) = raw.to_shape() {
                    log::debug!("skipping saved annotation: {err}");
                    continue;
                }
                let Some(persisted_id) = raw.correlation_id.clone() else {
                    continue;
                };
                if known.insert(persisted_id) && engine.add_annotation(viewport_index, raw) {
                    added += 1;
                }
            }
            log::info!(
                "viewport {viewport_index}: loaded {added} saved annotation(s) for {}",
                load.series_id
            );
        }
    }

    fn poll_lookups(
        &mut self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        now: Instant,
    ) -> Vec<ResolvedDetails> {
        let mut resolved = Vec::new();
        let lookups = std::mem::take(&mut self.lookups);
        for (series_id, mut lookup) in lookups {
            match lookup.job.poll() {
                JobPoll::Pending => {
                    self.lookups.insert(series_id, lookup);
                }
                JobPoll::Ready(Ok(records)) => {
                    log::debug!(
                        "fetched {} annotation record(s) for series {series_id}",
                        records.len()
                    );
                    for record in records {
                        self.cache.insert(
                            record.id.clone(),
                            CacheEntry {
                                record,
                                fetched_at: now,
                            },
                        );
                    }
                    for target in lookup.waiters {
                        if let Some(details) = self.enriched(registry, engine, &target, now) {
                            resolved.push(ResolvedDetails { target, details });
                        }
                    }
                }
                JobPoll::Ready(Err(err)) => {
                    let err = ViewerError::Resolution(format!("{series_id}: {err:#}"));
                    log::warn!("{err}");
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
        resolved
    }

    fn enriched(
        &self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        target: &AnnotationRef,
        now: Instant,
    ) -> Option<AnnotationDetails> {
        let shape = match Self::current_shape(registry, engine, target) {
            Ok(shape) => shape,
            Err(err) => {
                log::debug!("discarding resolved metadata: {err}");
                return None;
            }
        };
        let persisted_id = shape.persisted_id()?;
        let Some(record) = self.cached(persisted_id, now) else {
            log::warn!("backend has no annotation record {persisted_id}");
            return None;
        };
        let mut details = AnnotationDetails::from_shape(&shape);
        details.enrich(record);
        Some(details)
    }

    /// Every shape on every viewport bound to `series_id`, with the instance
    /// it most likely belongs to.
    pub fn collect_series_annotations(
        &self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        series_id: &SeriesId,
        instances: &[InstanceRecord],
    ) -> Vec<CollectedAnnotation> {
        let mut collected = Vec::new();
        for viewport_index in registry.viewports_for_series(series_id) {
            for shape in collect_shapes(engine, viewport_index) {
                let instance = match_instance(&shape, instances).cloned();
                collected.push(CollectedAnnotation {
                    viewport_index,
                    shape,
                    instance,
                });
            }
        }
        collected
    }

    /// Posts a draft. The engine shape is promoted when the backend answers.
    pub fn save_draft(
        &mut self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        target: &AnnotationRef,
    ) -> ViewerResult<()> {
        let shape = Self::current_shape(registry, engine, target)?;
        if let Some(persisted_id) = shape.persisted_id() {
            return Err(ViewerError::InvalidTransition(format!(
                "annotation {} is already persisted as {persisted_id}",
                shape.client_id
            )));
        }
        if self.is_saving(&shape.client_id) {
            return Err(ViewerError::InvalidTransition(format!(
                "annotation {} is already being saved",
                shape.client_id
            )));
        }
        let series_id = registry
            .binding(target.viewport_index)
            .map(|binding| binding.series.id.clone())
            .ok_or(ViewerError::ViewportOutOfRange(target.viewport_index))?;

        let body = NewAnnotation::from_shape(series_id.as_str(), &shape);
        let backend = Arc::clone(&self.backend);
        let series = series_id.clone();
        let job = Job::spawn(self.mode, format!("save-{}", shape.client_id), move |_| {
            backend.create_annotation(&series, &body)
        });
        self.saves.push(PendingSave {
            viewport_index: target.viewport_index,
            series_id,
            client_id: shape.client_id,
            job,
        });
        Ok(())
    }

    /// Removes the shape from the engine right away. Persisted shapes also get
    /// one backend delete and are put back if it fails. Returns false when the
    /// shape was already gone.
    pub fn delete_annotation(
        &mut self,
        registry: &SeriesRegistry,
        engine: &mut dyn RenderingEngine,
        target: &AnnotationRef,
    ) -> ViewerResult<bool> {
        registry.ensure_current(target.viewport_index, target.generation)?;
        let Some(raw) = engine.annotation(target.viewport_index, &target.client_id) else {
            log::debug!("delete skipped, annotation {} already gone", target.client_id);
            return Ok(false);
        };
        engine.remove_annotation(target.viewport_index, &target.client_id);
        let Some(persisted_id) = raw.correlation_id.clone() else {
            return Ok(true);
        };
        self.cache.remove(&persisted_id);

        let backend = Arc::clone(&self.backend);
        let job = Job::spawn(self.mode, format!("delete-{persisted_id}"), move |_| {
            backend.delete_annotation(&persisted_id)
        });
        self.deletes.push(PendingDelete {
            target: target.clone(),
            raw,
            job,
        });
        Ok(true)
    }

    pub fn update_annotation(
        &mut self,
        registry: &SeriesRegistry,
        engine: &dyn RenderingEngine,
        target: &AnnotationRef,
        patch: AnnotationPatch,
    ) -> ViewerResult<()> {
        let shape = Self::current_shape(registry, engine, target)?;
        let persisted_id = shape.persisted_id().map(str::to_string).ok_or_else(|| {
            ViewerError::InvalidTransition(format!(
                "annotation {} must be saved before it can be edited",
                shape.client_id
            ))
        })?;
        let backend = Arc::clone(&self.backend);
        let id = persisted_id.clone();
        let job = Job::spawn(self.mode, format!("update-{persisted_id}"), move |_| {
            backend.update_annotation(&id, &patch)
        });
        self.updates.push(PendingUpdate { persisted_id, job });
        Ok(())
    }

    fn poll_saves(
        &mut self,
        engine: &mut dyn RenderingEngine,
        notifications: &mut Notifications,
        now: Instant,
    ) {
        let saves = std::mem::take(&mut self.saves);
        for mut save in saves {
            match save.job.poll() {
                JobPoll::Pending => self.saves.push(save),
                JobPoll::Ready(Ok(record)) => {
                    let promoted =
                        engine.set_correlation_id(save.viewport_index, &save.client_id, &record.id);
                    if promoted {
                        log::info!(
                            "annotation {} saved to series {} as {}",
                            save.client_id,
                            save.series_id,
                            record.id
                        );
                        notifications.info("Annotation saved", now);
                    } else {
                        log::warn!(
                            "annotation {} vanished before record {} came back",
                            save.client_id,
                            record.id
                        );
                    }
                    self.cache.insert(
                        record.id.clone(),
                        CacheEntry {
                            record,
                            fetched_at: now,
                        },
                    );
                }
                JobPoll::Ready(Err(err)) => {
                    notifications.report(&ViewerError::persistence("Saving annotation", &err), now);
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    fn poll_deletes(
        &mut self,
        registry: &SeriesRegistry,
        engine: &mut dyn RenderingEngine,
        notifications: &mut Notifications,
        now: Instant,
    ) {
        let deletes = std::mem::take(&mut self.deletes);
        for mut delete in deletes {
            match delete.job.poll() {
                JobPoll::Pending => self.deletes.push(delete),
                JobPoll::Ready(Ok(())) => {
                    log::info!("annotation {} deleted", delete.target.client_id);
                }
                JobPoll::Ready(Err(err)) => {
                    notifications
                        .report(&ViewerError::persistence("Deleting annotation", &err), now);
                    let target = &delete.target;
                    if registry.is_current(target.viewport_index, target.generation) {
                        engine.add_annotation(target.viewport_index, delete.raw);
                    }
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    fn poll_updates(&mut self, notifications: &mut Notifications, now: Instant) {
        let updates = std::mem::take(&mut self.updates);
        for mut update in updates {
            match update.job.poll() {
                JobPoll::Pending => self.updates.push(update),
                JobPoll::Ready(Ok(record)) => {
                    log::debug!("annotation record {} updated", update.persisted_id);
                    self.cache.insert(
                        record.id.clone(),
                        CacheEntry {
                            record,
                            fetched_at: now,
                        },
                    );
                }
                JobPoll::Ready(Err(err)) => {
                    notifications
                        .report(&ViewerError::persistence("Updating annotation", &err), now);
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {}
            }
        }
    }

    /// Drops every in-flight lookup and load, as on viewer teardown.
    pub fn cancel_all(&mut self) {
        for lookup in self.lookups.values_mut() {
            lookup.job.cancel();
        }
        self.lookups.clear();
        for load in &mut self.loads {
            load.job.cancel();
        }
        self.loads.clear();
    }

    /// Forgets lookups and loads tied to a viewport that was rebound.
    pub fn forget_viewport(&mut self, viewport_index: usize) {
        self.cancel_loads(viewport_index);
        for lookup in self.lookups.values_mut() {
            lookup
                .waiters
                .retain(|target| target.viewport_index != viewport_index);
        }
    }
}

/// Slice index into the expanded frame list first, then a fuzzy match of the
/// referenced image id against instance ids, SOP instance UIDs and file names.
pub fn match_instance<'a>(
    shape: &AnnotationShape,
    instances: &'a [InstanceRecord],
) -> Option<&'a InstanceRecord> {
    let mut first_frame = 0usize;
    for instance in instances {
        let frames = instance.frame_count.max(1);
        if shape.slice_index < first_frame + frames {
            return Some(instance);
        }
        first_frame += frames;
    }

    let reference = parse_image_id(&shape.referenced_image_ref)
        .map(|image| image.location)
        .unwrap_or(shape.referenced_image_ref.as_str())
        .to_ascii_lowercase();
    if reference.is_empty() {
        return None;
    }
    instances.iter().find(|instance| {
        let candidates = [
            Some(instance.id.as_str()),
            instance.sop_instance_uid.as_deref(),
            instance.file_name.as_deref(),
            Some(instance.file_path.as_str()),
        ];
        candidates
            .into_iter()
            .flatten()
            .filter(|candidate| !candidate.is_empty())
            .any(|candidate| reference.contains(&candidate.to_ascii_lowercase()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::ToolType;
    use crate::backend::testing::FakeBackend;
    use crate::engine::testing::FakeEngine;
    use crate::geometry::Point;
    use crate::registry::GridLayout;
    use crate::series::SeriesDescriptor;

    struct Fixture {
        backend: Arc<FakeBackend>,
        bridge: AnnotationSyncBridge,
        registry: SeriesRegistry,
        engine: FakeEngine,
        notifications: Notifications,
    }

    impl Fixture {
        fn new(backend: FakeBackend) -> Self {
            let backend = Arc::new(backend);
            let shared: Arc<dyn Backend> = backend.clone();
            let mut registry = SeriesRegistry::new(GridLayout::Quad);
            registry
                .assign(0, SeriesDescriptor::from_backend("s1"))
                .expect("assign");
            registry
                .assign(1, SeriesDescriptor::from_backend("s1"))
                .expect("assign");
            Self {
                backend,
                bridge: AnnotationSyncBridge::new(shared, JobMode::Inline, DEFAULT_CACHE_TTL),
                registry,
                engine: FakeEngine::with_viewports(&[0, 1]),
                notifications: Notifications::default(),
            }
        }

        fn add(
            &mut self,
            viewport: usize,
            slice: usize,
            persisted_id: Option<&str>,
        ) -> AnnotationRef {
            let mut shape = AnnotationShape::draft(
                ToolType::Length,
                vec![Point::new(1.0, 1.0), Point::new(9.0, 9.0)],
                slice,
                format!("wadouri:files/img-{slice}.dcm"),
            );
            if let Some(id) = persisted_id {
                shape.promote(id.to_string()).expect("draft promotes");
            }
            self.engine.insert(viewport, &shape);
            AnnotationRef {
                viewport_index: viewport,
                generation: self.registry.generation(viewport).expect("bound"),
                client_id: shape.client_id,
            }
        }

        fn seed_record(&self, id: &str, notes: &str) {
            self.backend
                .annotations
                .lock()
                .expect("lock")
                .entry(SeriesId::new("s1"))
                .or_default()
                .push(PersistedAnnotation {
                    id: id.to_string(),
                    series_id: "s1".to_string(),
                    slice_index: 0,
                    tool_type: ToolType::Length,
                    points: Vec::new(),
                    referenced_image_ref: None,
                    status: Some("reviewed".to_string()),
                    annotator_id: Some("dr-a".to_string()),
                    reviewer_id: None,
                    color_code: None,
                    notes: Some(notes.to_string()),
                    label: None,
                    created_at: None,
                    updated_at: None,
                });
        }

        fn poll(&mut self, now: Instant) -> Vec<ResolvedDetails> {
            self.bridge
                .poll(&self.registry, &mut self.engine, &mut self.notifications, now)
        }
    }

    #[test]
    fn draft_resolves_without_network() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 0, None);
        let resolution = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &target, Instant::now())
            .expect("resolves");
        assert!(matches!(resolution, Resolution::Ready(_)));
        assert_eq!(resolution.details().persisted_id, None);
        assert_eq!(fx.backend.total_calls(), 0);
        assert!(!fx.bridge.has_pending_work());
    }

    #[test]
    fn persisted_shape_is_enriched_then_served_from_cache() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "follow up");
        let target = fx.add(0, 0, Some("db-1"));
        let t0 = Instant::now();

        let first = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &target, t0)
            .expect("resolves");
        assert!(matches!(first, Resolution::Pending(ref d) if !d.enriched));

        let resolved = fx.poll(t0);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].details.notes.as_deref(), Some("follow up"));
        assert!(resolved[0].details.enriched);

        let second = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &target, t0 + Duration::from_secs(5))
            .expect("cached");
        assert!(matches!(second, Resolution::Ready(ref d) if d.enriched));
        assert_eq!(fx.backend.calls("list_annotations"), 1);
    }

    #[test]
    fn concurrent_resolves_share_one_series_lookup() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "a");
        fx.seed_record("db-2", "b");
        let first = fx.add(0, 0, Some("db-1"));
        let second = fx.add(1, 3, Some("db-2"));
        let t0 = Instant::now();

        for target in [&first, &second, &first] {
            fx.bridge
                .resolve(&fx.registry, &fx.engine, target, t0)
                .expect("resolves");
        }
        let resolved = fx.poll(t0);
        assert_eq!(resolved.len(), 2);
        assert_eq!(fx.backend.calls("list_annotations"), 1);
    }

    #[test]
    fn expired_cache_entry_triggers_new_lookup() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "a");
        let target = fx.add(0, 0, Some("db-1"));
        let t0 = Instant::now();
        fx.bridge
            .resolve(&fx.registry, &fx.engine, &target, t0)
            .expect("resolves");
        fx.poll(t0);

        let later = t0 + DEFAULT_CACHE_TTL + Duration::from_secs(1);
        let again = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &target, later)
            .expect("resolves");
        assert!(matches!(again, Resolution::Pending(_)));
        assert_eq!(fx.backend.calls("list_annotations"), 2);
    }

    #[test]
    fn results_for_rebound_viewport_are_discarded() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "a");
        let target = fx.add(0, 0, Some("db-1"));
        let t0 = Instant::now();
        fx.bridge
            .resolve(&fx.registry, &fx.engine, &target, t0)
            .expect("resolves");

        fx.registry
            .assign(0, SeriesDescriptor::from_backend("s2"))
            .expect("rebind");
        assert!(fx.poll(t0).is_empty());
        assert!(matches!(
            fx.bridge.resolve(&fx.registry, &fx.engine, &target, t0),
            Err(ViewerError::Stale { .. })
        ));
    }

    #[test]
    fn vanished_shape_result_is_discarded() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "a");
        let target = fx.add(0, 0, Some("db-1"));
        let t0 = Instant::now();
        fx.bridge
            .resolve(&fx.registry, &fx.engine, &target, t0)
            .expect("resolves");
        fx.engine.remove_annotation(0, &target.client_id);
        assert!(fx.poll(t0).is_empty());
    }

    #[test]
    fn failed_lookup_is_logged_not_notified() {
        let mut fx = Fixture::new(FakeBackend::failing_reads());
        let target = fx.add(0, 0, Some("db-1"));
        let t0 = Instant::now();
        let partial = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &target, t0)
            .expect("partial data");
        assert_eq!(partial.details().persisted_id.as_deref(), Some("db-1"));
        assert!(fx.poll(t0).is_empty());
        assert!(fx.notifications.is_empty());
        assert!(!fx.bridge.has_pending_work());
    }

    #[test]
    fn save_draft_promotes_engine_shape() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 2, None);
        fx.bridge
            .save_draft(&fx.registry, &fx.engine, &target)
            .expect("save starts");
        assert!(fx.bridge.save_draft(&fx.registry, &fx.engine, &target).is_err());
        fx.poll(Instant::now());

        let raw = fx.engine.annotation(0, &target.client_id).expect("still there");
        assert_eq!(raw.correlation_id.as_deref(), Some("ann-1"));
        assert!(matches!(
            fx.bridge.save_draft(&fx.registry, &fx.engine, &target),
            Err(ViewerError::InvalidTransition(_))
        ));
        assert_eq!(fx.backend.calls("create_annotation"), 1);
    }

    #[test]
    fn failed_save_leaves_draft_and_notifies() {
        let mut fx = Fixture::new(FakeBackend::failing_writes());
        let target = fx.add(0, 2, None);
        fx.bridge
            .save_draft(&fx.registry, &fx.engine, &target)
            .expect("save starts");
        fx.poll(Instant::now());
        let raw = fx.engine.annotation(0, &target.client_id).expect("still there");
        assert_eq!(raw.correlation_id, None);
        assert_eq!(fx.notifications.len(), 1);
    }

    #[test]
    fn deleting_draft_makes_no_backend_call() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 0, None);
        let removed = fx
            .bridge
            .delete_annotation(&fx.registry, &mut fx.engine, &target)
            .expect("deleted");
        assert!(removed);
        fx.poll(Instant::now());
        assert_eq!(fx.backend.total_calls(), 0);
        assert!(fx.engine.annotation(0, &target.client_id).is_none());
    }

    #[test]
    fn deleting_persisted_makes_exactly_one_backend_call() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 0, Some("db-4"));
        fx.bridge
            .delete_annotation(&fx.registry, &mut fx.engine, &target)
            .expect("deleted");
        let again = fx
            .bridge
            .delete_annotation(&fx.registry, &mut fx.engine, &target)
            .expect("tolerates vanished target");
        assert!(!again);
        fx.poll(Instant::now());
        assert_eq!(fx.backend.calls("delete_annotation"), 1);
    }

    #[test]
    fn failed_delete_puts_shape_back() {
        let mut fx = Fixture::new(FakeBackend::failing_writes());
        let target = fx.add(0, 0, Some("db-4"));
        fx.bridge
            .delete_annotation(&fx.registry, &mut fx.engine, &target)
            .expect("delete starts");
        fx.poll(Instant::now());
        assert!(fx.engine.annotation(0, &target.client_id).is_some());
        assert_eq!(fx.notifications.len(), 1);
    }

    #[test]
    fn update_requires_persisted_shape() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.seed_record("db-1", "old");
        let draft = fx.add(0, 0, None);
        let saved = fx.add(0, 1, Some("db-1"));
        let patch = AnnotationPatch {
            notes: Some("new".to_string()),
            ..AnnotationPatch::default()
        };
        assert!(fx
            .bridge
            .update_annotation(&fx.registry, &fx.engine, &draft, patch.clone())
            .is_err());
        fx.bridge
            .update_annotation(&fx.registry, &fx.engine, &saved, patch)
            .expect("update starts");
        let t0 = Instant::now();
        fx.poll(t0);
        assert_eq!(fx.backend.calls("update_annotation"), 1);

        let resolved = fx
            .bridge
            .resolve(&fx.registry, &fx.engine, &saved, t0)
            .expect("cached after update");
        assert_eq!(resolved.details().notes.as_deref(), Some("new"));
    }

    #[test]
    fn collection_spans_viewports_and_matches_instances() {
        let mut fx = Fixture::new(FakeBackend::default());
        fx.add(0, 0, None);
        fx.add(1, 2, Some("db-1"));
        fx.add(1, 40, None);
        let instances = vec![
            InstanceRecord {
                id: "i-0".to_string(),
                sop_instance_uid: Some("1.2.3.0".to_string()),
                file_path: "files/img-0.dcm".to_string(),
                file_name: Some("img-0.dcm".to_string()),
                frame_count: 1,
            },
            InstanceRecord {
                id: "i-1".to_string(),
                sop_instance_uid: None,
                file_path: "files/cine.dcm".to_string(),
                file_name: None,
                frame_count: 3,
            },
            InstanceRecord {
                id: "i-40".to_string(),
                sop_instance_uid: None,
                file_path: "files/img-40.dcm".to_string(),
                file_name: Some("img-40.dcm".to_string()),
                frame_count: 1,
            },
        ];

        let collected = fx.bridge.collect_series_annotations(
            &fx.registry,
            &fx.engine,
            &SeriesId::new("s1"),
            &instances,
        );
        assert_eq!(collected.len(), 3);
        let matched = collected
            .iter()
            .map(|item| {
                (
                    item.viewport_index,
                    item.instance.as_ref().map(|i| i.id.as_str()),
                )
            })
            .collect::<Vec<_>>();
        assert!(matched.contains(&(0, Some("i-0"))));
        assert!(matched.contains(&(1, Some("i-1"))));
        assert!(matched.contains(&(1, Some("i-40"))));
    }

    #[test]
    fn saved_annotations_come_back_after_rebind() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 2, None);
        fx.bridge
            .save_draft(&fx.registry, &fx.engine, &target)
            .expect("save starts");
        fx.poll(Instant::now());

        let generation = fx
            .registry
            .assign(0, SeriesDescriptor::from_backend("s1"))
            .expect("rebind")
            .generation;
        fx.engine.bind(0, generation);
        let series = SeriesId::new("s1");
        assert!(fx
            .bridge
            .collect_series_annotations(&fx.registry, &fx.engine, &series, &[])
            .iter()
            .all(|item| item.viewport_index != 0));

        fx.bridge.load_for_binding(0, generation, &series);
        fx.poll(Instant::now());
        fx.bridge.load_for_binding(0, generation, &series);
        fx.poll(Instant::now());

        let reloaded = fx
            .bridge
            .collect_series_annotations(&fx.registry, &fx.engine, &series, &[])
            .into_iter()
            .filter(|item| item.viewport_index == 0)
            .collect::<Vec<_>>();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded[0].shape.persisted_id(), Some("ann-1"));
        assert_eq!(reloaded[0].shape.slice_index, 2);
        assert_eq!(reloaded[0].shape.geometry.len(), 2);
        assert!(!fx.bridge.has_pending_work());
    }

    #[test]
    fn saved_annotations_for_an_old_binding_are_dropped() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 1, None);
        fx.bridge
            .save_draft(&fx.registry, &fx.engine, &target)
            .expect("save starts");
        fx.poll(Instant::now());

        let first = fx.registry.generation(0).expect("bound");
        fx.engine.bind(0, first);
        fx.bridge.load_for_binding(0, first, &SeriesId::new("s1"));
        let second = fx
            .registry
            .assign(0, SeriesDescriptor::from_backend("s2"))
            .expect("rebind")
            .generation;
        fx.engine.bind(0, second);
        fx.poll(Instant::now());

        assert!(fx.engine.annotations.get(&0).map_or(true, Vec::is_empty));
    }

    #[test]
    fn cancel_all_drops_lookups() {
        let mut fx = Fixture::new(FakeBackend::default());
        let target = fx.add(0, 0, Some("db-1"));
        fx.bridge
            .resolve(&fx.registry, &fx.engine, &target, Instant::now())
            .expect("resolves");
        fx.bridge.cancel_all();
        assert!(!fx.bridge.has_pending_work());
        assert!(fx.poll(Instant::now()).is_empty());
    }
}
