use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::backend::Backend;
use crate::dicom::{read_instance_header, InstanceHeader};
use crate::jobs::{Job, JobMode, JobPoll};
use crate::registry::SeriesRegistry;
use crate::series::{ImageStack, InstanceRecord, SeriesDescriptor, SeriesId, SeriesSource};

/// Instances of a series, listed for one particular binding.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedStack {
    pub viewport_index: usize,
    pub generation: u64,
    pub series: SeriesDescriptor,
    pub instances: Vec<InstanceRecord>,
    pub stack: ImageStack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Descriptor(SeriesDescriptor),
    Stack(LoadedStack),
    Failed {
        viewport_index: Option<usize>,
        message: String,
    },
}

struct PendingStack {
    generation: u64,
    job: Job<Result<(SeriesDescriptor, Vec<InstanceRecord>)>>,
}

/// Lists the instances behind each binding and fetches series descriptors
/// requested at launch.
pub struct StackLoader {
    backend: Arc<dyn Backend>,
    mode: JobMode,
    stacks: HashMap<usize, PendingStack>,
    descriptors: Vec<Job<Result<SeriesDescriptor>>>,
}

impl StackLoader {
    pub fn new(backend: Arc<dyn Backend>, mode: JobMode) -> Self {
        Self {
            backend,
            mode,
            stacks: HashMap::new(),
            descriptors: Vec::new(),
        }
    }

    pub fn has_pending_work(&self) -> bool {
        !self.stacks.is_empty() || !self.descriptors.is_empty()
    }

    pub fn is_loading(&self, viewport_index: usize) -> bool {
        self.stacks.contains_key(&viewport_index)
    }

    /// Replaces any load still running for the viewport.
    pub fn request_stack(
        &mut self,
        viewport_index: usize,
        generation: u64,
        series: &SeriesDescriptor,
    ) {
        let backend = Arc::clone(&self.backend);
        let mut series = series.clone();
        let job = Job::spawn(self.mode, format!("stack-{viewport_index}"), move |_| {
            let instances = match &series.source {
                SeriesSource::Backend => backend.list_instances(&series.id)?,
                SeriesSource::LocalFiles { paths } => {
                    let (instances, first) = local_instances(paths)?;
                    if let Some(header) = first {
                        series.modality = series.modality.take().or(header.modality);
                        if let Some(description) = header.series_description {
                            series.description = description;
                        }
                    }
                    instances
                }
            };
            Ok((series, instances))
        });
        let pending = PendingStack { generation, job };
        if let Some(mut previous) = self.stacks.insert(viewport_index, pending) {
            previous.job.cancel();
        }
    }

    pub fn request_descriptor(&mut self, series_id: SeriesId) {
        let backend = Arc::clone(&self.backend);
        self.descriptors.push(Job::spawn(
            self.mode,
            format!("series-{series_id}"),
            move |_| backend.fetch_series(&series_id),
        ));
    }

    /// Collects finished work. Stacks whose binding has been replaced in the
    /// meantime are dropped.
    pub fn poll(&mut self, registry: &SeriesRegistry) -> Vec<LoadEvent> {
        let mut events = Vec::new();

        self.descriptors.retain_mut(|job| match job.poll() {
            JobPoll::Pending => true,
            JobPoll::Ready(Ok(descriptor)) => {
                events.push(LoadEvent::Descriptor(descriptor));
                false
            }
            JobPoll::Ready(Err(err)) => {
                log::warn!("{}: {err:#}", job.label());
                events.push(LoadEvent::Failed {
                    viewport_index: None,
                    message: format!("{err:#}"),
                });
                false
            }
            JobPoll::Cancelled | JobPoll::Disconnected => false,
        });

        let finished: Vec<usize> = self
            .stacks
            .iter_mut()
            .filter_map(|(viewport_index, pending)| {
                match pending.job.poll() {
                    JobPoll::Pending => return None,
                    JobPoll::Ready(result) => {
                        if let Some(event) =
                            stack_event(registry, *viewport_index, pending.generation, result)
                        {
                            events.push(event);
                        }
                    }
                    JobPoll::Cancelled | JobPoll::Disconnected => {}
                }
                Some(*viewport_index)
            })
            .collect();
        for viewport_index in finished {
            self.stacks.remove(&viewport_index);
        }
        events
    }

    pub fn cancel_viewport(&mut self, viewport_index: usize) {
        if let Some(mut pending) = self.stacks.remove(&viewport_index) {
            pending.job.cancel();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, mut pending) in self.stacks.drain() {
            pending.job.cancel();
        }
        for mut job in self.descriptors.drain(..) {
            job.cancel();
        }
    }
}

fn stack_event(
    registry: &SeriesRegistry,
    viewport_index: usize,
    generation: u64,
    result: Result<(SeriesDescriptor, Vec<InstanceRecord>)>,
) -> Option<LoadEvent> {
    if !registry.is_current(viewport_index, generation) {
        log::debug!(
            "discarding stack for viewport {viewport_index}: binding {generation} replaced"
        );
        return None;
    }
    match result {
        Ok((series, instances)) => {
            let stack = ImageStack::from_instances(series.id.clone(), &instances);
            Some(LoadEvent::Stack(LoadedStack {
                viewport_index,
                generation,
                series,
                instances,
                stack,
            }))
        }
        Err(err) => {
            log::warn!("viewport {viewport_index}: could not list instances: {err:#}");
            Some(LoadEvent::Failed {
                viewport_index: Some(viewport_index),
                message: format!("{err:#}"),
            })
        }
    }
}

/// Unreadable files are skipped; a selection with nothing readable fails.
/// Also returns the first readable header, which describes the series.
fn local_instances(paths: &[PathBuf]) -> Result<(Vec<InstanceRecord>, Option<InstanceHeader>)> {
    let mut instances = Vec::with_capacity(paths.len());
    let mut first = None;
    for path in paths {
        match read_instance_header(path) {
            Ok(header) => {
                instances.push(InstanceRecord {
                    id: path.to_string_lossy().to_string(),
                    sop_instance_uid: header.sop_instance_uid.clone(),
                    file_path: path.to_string_lossy().to_string(),
                    file_name: path
                        .file_name()
                        .map(|name| name.to_string_lossy().to_string()),
                    frame_count: header.frame_count,
                });
                first.get_or_insert(header);
            }
            Err(err) => log::warn!("skipping {}: {err:#}", path.display()),
        }
    }
    if instances.is_empty() && !paths.is_empty() {
        bail!("None of the {} selected file(s) could be read as DICOM", paths.len());
    }
    Ok((instances, first))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::registry::GridLayout;

    fn instance(id: &str, frames: usize) -> InstanceRecord {
        InstanceRecord {
            id: id.to_string(),
            sop_instance_uid: Some(format!("1.2.{id}")),
            file_path: format!("s1/{id}.dcm"),
            file_name: Some(format!("{id}.dcm")),
            frame_count: frames,
        }
    }

    fn fixture() -> (Arc<FakeBackend>, SeriesRegistry, StackLoader) {
        let backend = Arc::new(FakeBackend::default());
        if let Ok(mut instances) = backend.instances.lock() {
            instances.insert(SeriesId::new("s1"), vec![instance("a", 1), instance("b", 3)]);
        }
        let registry = SeriesRegistry::new(GridLayout::Quad);
        let loader = StackLoader::new(backend.clone(), JobMode::Inline);
        (backend, registry, loader)
    }

    #[test]
    fn stack_expands_multi_frame_instances() {
        let (_, mut registry, mut loader) = fixture();
        let series = SeriesDescriptor::from_backend("s1");
        registry.assign(0, series.clone()).expect("assign");
        let generation = registry.generation(0).expect("bound");

        loader.request_stack(0, generation, &series);
        let events = loader.poll(&registry);
        let [LoadEvent::Stack(loaded)] = events.as_slice() else {
            panic!("expected one stack, got {events:?}");
        };
        assert_eq!(loaded.stack.len(), 4);
        assert_eq!(loaded.instances.len(), 2);
        assert!(!loader.has_pending_work());
    }

    #[test]
    fn reassigned_viewport_discards_old_stack() {
        let (_, mut registry, mut loader) = fixture();
        let series = SeriesDescriptor::from_backend("s1");
        registry.assign(1, series.clone()).expect("assign");
        let stale = registry.generation(1).expect("bound");
        loader.request_stack(1, stale, &series);
        registry
            .assign(1, SeriesDescriptor::from_backend("s2"))
            .expect("reassign");

        assert!(loader.poll(&registry).is_empty());
    }

    #[test]
    fn listing_failure_is_reported_for_the_viewport() {
        let backend = Arc::new(FakeBackend::failing_reads());
        let mut registry = SeriesRegistry::new(GridLayout::Quad);
        let mut loader = StackLoader::new(backend, JobMode::Inline);
        let series = SeriesDescriptor::from_backend("s1");
        registry.assign(2, series.clone()).expect("assign");
        loader.request_stack(2, registry.generation(2).expect("bound"), &series);

        assert!(matches!(
            loader.poll(&registry).as_slice(),
            [LoadEvent::Failed {
                viewport_index: Some(2),
                ..
            }]
        ));
    }

    #[test]
    fn descriptors_are_fetched_by_id() {
        let (backend, registry, mut loader) = fixture();
        loader.request_descriptor(SeriesId::new("s9"));
        let events = loader.poll(&registry);
        assert!(matches!(
            events.as_slice(),
            [LoadEvent::Descriptor(descriptor)] if descriptor.id.as_str() == "s9"
        ));
        assert_eq!(backend.calls("fetch_series"), 1);
    }

    #[test]
    fn unreadable_local_selection_fails() {
        let missing = std::env::temp_dir().join(format!(
            "radview-loader-{}-missing.dcm",
            std::process::id()
        ));
        assert!(local_instances(&[missing]).is_err());
        assert!(local_instances(&[]).expect("empty selection").0.is_empty());
    }
}
