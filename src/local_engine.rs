use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use eframe::egui::ColorImage;

use crate::annotation::{AnnotationShape, ToolType};
use crate::backend::Backend;
use crate::dicom::{decode_dicom_bytes, DicomImage, FramePixels};
use crate::engine::{FlipAxis, RawAnnotation, RenderingEngine};
use crate::geometry::{Point, ViewTransform};
use crate::jobs::{Job, JobMode, JobPoll};
use crate::labelmap::Mask;
use crate::registry::MAX_VIEWPORTS;
use crate::renderer::{blend_labelmap, labelmap_color, render_rgb, render_window_level};
use crate::segmentation::LabelmapSnapshot;
use crate::series::{parse_image_id, ImageStack};

pub const DEFAULT_BRUSH_RADIUS: f32 = 6.0;
const MIN_ZOOM: f32 = 0.1;
const MAX_ZOOM: f32 = 20.0;
/// Image-space spacing below which freehand samples are merged.
const FREEHAND_SPACING: f32 = 2.0;
/// Two-point tools need at least this much drag to produce a shape.
const MIN_DRAG: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActiveTool {
    Navigate,
    Annotate(ToolType),
    Brush {
        layer_id: u64,
        erase: bool,
        radius: f32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrokeOutcome {
    Annotation {
        viewport_index: usize,
        client_id: String,
    },
    Painted {
        layer_id: u64,
        snapshot: LabelmapSnapshot,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    Unbound,
    Loading,
    Failed(String),
    Ready,
}

struct Element {
    generation: u64,
    stack: ImageStack,
    current: usize,
    viewport_size: (f32, f32),
    zoom: f32,
    pan: Point,
    rotation: u8,
    flip_horizontal: bool,
    flip_vertical: bool,
    annotations: Vec<RawAnnotation>,
}

impl Element {
    fn new(generation: u64, stack: ImageStack) -> Self {
        Self {
            generation,
            stack,
            current: 0,
            viewport_size: (1.0, 1.0),
            zoom: 1.0,
            pan: Point::default(),
            rotation: 0,
            flip_horizontal: false,
            flip_vertical: false,
            annotations: Vec::new(),
        }
    }

    fn image_id(&self) -> Option<&str> {
        self.stack.image_ids.get(self.current).map(String::as_str)
    }

    fn reset_view(&mut self) {
        self.zoom = 1.0;
        self.pan = Point::default();
        self.rotation = 0;
        self.flip_horizontal = false;
        self.flip_vertical = false;
    }
}

enum Decoded {
    Loading(Job<Result<DicomImage>>),
    Ready(Arc<DicomImage>),
    Failed(String),
}

#[derive(Default)]
struct LayerLabelmap {
    visible: bool,
    /// Keyed by image id so a layer only shows on the stack it was painted on.
    slices: BTreeMap<String, (usize, Mask)>,
}

struct Stroke {
    viewport_index: usize,
    tool: ActiveTool,
    points: Vec<Point>,
}

/// In-process rendering engine: decodes frames fetched through the backend,
/// keeps per-viewport annotation state and per-layer labelmaps, and runs the
/// drawing tools.
pub struct LocalEngine {
    backend: Arc<dyn Backend>,
    job_mode: JobMode,
    elements: Vec<Option<Element>>,
    images: HashMap<String, Decoded>,
    labelmaps: BTreeMap<u64, LayerLabelmap>,
    stroke: Option<Stroke>,
    annotator_id: Option<String>,
    revision: u64,
}

impl LocalEngine {
    pub fn new(backend: Arc<dyn Backend>, job_mode: JobMode) -> Self {
        Self {
            backend,
            job_mode,
            elements: (0..MAX_VIEWPORTS).map(|_| None).collect(),
            images: HashMap::new(),
            labelmaps: BTreeMap::new(),
            stroke: None,
            annotator_id: None,
            revision: 0,
        }
    }

    pub fn set_annotator(&mut self, annotator_id: Option<String>) {
        self.annotator_id = annotator_id;
    }

    /// Bumped whenever anything visible changes; callers re-upload textures
    /// when it moves.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Creates the viewport element for a freshly bound stack, dropping any
    /// annotations the previous binding left behind.
    pub fn enable(&mut self, viewport_index: usize, generation: u64, stack: ImageStack) -> bool {
        let Some(slot) = self.elements.get_mut(viewport_index) else {
            return false;
        };
        let viewport_size = slot
            .as_ref()
            .map(|element| element.viewport_size)
            .unwrap_or((1.0, 1.0));
        let mut element = Element::new(generation, stack);
        element.viewport_size = viewport_size;
        *slot = Some(element);
        if self
            .stroke
            .as_ref()
            .is_some_and(|stroke| stroke.viewport_index == viewport_index)
        {
            self.stroke = None;
        }
        self.prune_images();
        self.request_current(viewport_index);
        self.revision += 1;
        true
    }

    pub fn disable(&mut self, viewport_index: usize) {
        if let Some(slot) = self.elements.get_mut(viewport_index) {
            if slot.take().is_some() {
                self.prune_images();
                self.revision += 1;
            }
        }
    }

    pub fn image_id(&self, viewport_index: usize) -> Option<&str> {
        self.element(viewport_index)?.image_id()
    }

    pub fn set_viewport_size(&mut self, viewport_index: usize, width: f32, height: f32) {
        if let Some(element) = self.element_mut(viewport_index) {
            element.viewport_size = (width.max(1.0), height.max(1.0));
        }
    }

    pub fn zoom_by(&mut self, viewport_index: usize, factor: f32) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        if let Some(element) = self.element_mut(viewport_index) {
            element.zoom = (element.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM);
        }
    }

    pub fn pan_by(&mut self, viewport_index: usize, dx: f32, dy: f32) {
        if let Some(element) = self.element_mut(viewport_index) {
            element.pan = Point::new(element.pan.x + dx, element.pan.y + dy);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.images
            .values()
            .any(|decoded| matches!(decoded, Decoded::Loading(_)))
    }

    /// Moves finished decode jobs into the image cache. Returns true if any
    /// frame became displayable or failed.
    pub fn poll(&mut self) -> bool {
        let mut changed = false;
        for (location, decoded) in self.images.iter_mut() {
            let Decoded::Loading(job) = decoded else {
                continue;
            };
            match job.poll() {
                JobPoll::Pending => {}
                JobPoll::Ready(Ok(image)) => {
                    log::debug!(
                        "decoded {location}: {}x{}, {} frame(s)",
                        image.width,
                        image.height,
                        image.frame_count()
                    );
                    *decoded = Decoded::Ready(Arc::new(image));
                    changed = true;
                }
                JobPoll::Ready(Err(err)) => {
                    log::warn!("could not load {location}: {err:#}");
                    *decoded = Decoded::Failed(format!("{err:#}"));
                    changed = true;
                }
                JobPoll::Cancelled | JobPoll::Disconnected => {
                    *decoded = Decoded::Failed("load was interrupted".to_string());
                    changed = true;
                }
            }
        }
        if changed {
            self.revision += 1;
        }
        changed
    }

    pub fn frame_status(&self, viewport_index: usize) -> FrameStatus {
        let Some(image_id) = self.image_id(viewport_index) else {
            return FrameStatus::Unbound;
        };
        let Some(image) = parse_image_id(image_id) else {
            return FrameStatus::Failed(format!("unsupported image id {image_id}"));
        };
        match self.images.get(image.location) {
            None | Some(Decoded::Loading(_)) => FrameStatus::Loading,
            Some(Decoded::Failed(reason)) => FrameStatus::Failed(reason.clone()),
            Some(Decoded::Ready(decoded)) => {
                if image.frame.unwrap_or(0) < decoded.frame_count() {
                    FrameStatus::Ready
                } else {
                    FrameStatus::Failed(format!("{image_id} is past the last frame"))
                }
            }
        }
    }

    /// Window/levelled current frame with every visible labelmap blended in.
    pub fn render(&self, viewport_index: usize) -> Option<ColorImage> {
        let image_id = self.image_id(viewport_index)?;
        let (decoded, frame) = self.decoded_frame(image_id)?;
        let mut rendered = match &decoded.pixels {
            FramePixels::Mono(frames) => render_window_level(
                decoded.width,
                decoded.height,
                frames.get(frame)?,
                decoded.invert,
                decoded.window_center,
                decoded.window_width,
            ),
            FramePixels::Rgb {
                samples_per_pixel,
                frames,
            } => render_rgb(
                decoded.width,
                decoded.height,
                frames.get(frame)?,
                *samples_per_pixel,
            ),
        };
        for (layer_id, labelmap) in &self.labelmaps {
            if !labelmap.visible {
                continue;
            }
            if let Some((_, mask)) = labelmap.slices.get(image_id) {
                blend_labelmap(&mut rendered, mask, labelmap_color(*layer_id));
            }
        }
        Some(rendered)
    }

    pub fn begin_stroke(
        &mut self,
        viewport_index: usize,
        tool: ActiveTool,
        display: Point,
    ) -> bool {
        if matches!(tool, ActiveTool::Navigate) {
            return false;
        }
        let Some(transform) = self.view_transform(viewport_index) else {
            return false;
        };
        self.stroke = Some(Stroke {
            viewport_index,
            tool,
            points: Vec::new(),
        });
        self.extend_stroke(transform.display_to_image(display));
        true
    }

    pub fn drag_stroke(&mut self, display: Point) {
        let Some(viewport_index) = self.stroke.as_ref().map(|stroke| stroke.viewport_index) else {
            return;
        };
        if let Some(transform) = self.view_transform(viewport_index) {
            self.extend_stroke(transform.display_to_image(display));
        }
    }

    pub fn cancel_stroke(&mut self) {
        if self.stroke.take().is_some() {
            self.revision += 1;
        }
    }

    /// Image-space points of the stroke in progress on `viewport_index`.
    pub fn stroke_preview(&self, viewport_index: usize) -> Option<(ActiveTool, &[Point])> {
        let stroke = self.stroke.as_ref()?;
        (stroke.viewport_index == viewport_index)
            .then_some((stroke.tool, stroke.points.as_slice()))
    }

    pub fn finish_stroke(&mut self) -> Option<StrokeOutcome> {
        let stroke = self.stroke.take()?;
        match stroke.tool {
            ActiveTool::Navigate => None,
            ActiveTool::Annotate(tool_type) => self.complete_annotation(stroke, tool_type),
            ActiveTool::Brush { layer_id, .. } => {
                let element = self.element(stroke.viewport_index)?;
                let image_id = element.image_id()?.to_string();
                let (slice_index, mask) =
                    self.labelmaps.get(&layer_id)?.slices.get(&image_id)?;
                Some(StrokeOutcome::Painted {
                    layer_id,
                    snapshot: LabelmapSnapshot {
                        slice_index: *slice_index,
                        image_ref: image_id,
                        labelmap: mask.encode(),
                    },
                })
            }
        }
    }

    fn extend_stroke(&mut self, point: Point) {
        let Some(stroke) = self.stroke.as_mut() else {
            return;
        };
        if let ActiveTool::Brush {
            layer_id,
            erase,
            radius,
        } = stroke.tool
        {
            let viewport_index = stroke.viewport_index;
            stroke.points.push(point);
            if self.paint(viewport_index, layer_id, point, radius, !erase) > 0 {
                self.revision += 1;
            }
            return;
        }
        let far_enough = stroke
            .points
            .last()
            .map_or(true, |last| last.distance_to(point) >= FREEHAND_SPACING);
        if far_enough || stroke.points.len() < 2 {
            stroke.points.push(point);
        } else if let Some(last) = stroke.points.last_mut() {
            *last = point;
        }
        self.revision += 1;
    }

    fn paint(
        &mut self,
        viewport_index: usize,
        layer_id: u64,
        center: Point,
        radius: f32,
        value: bool,
    ) -> usize {
        let Some(element) = self.element(viewport_index) else {
            return 0;
        };
        let Some(image_id) = element.image_id().map(str::to_string) else {
            return 0;
        };
        let slice_index = element.current;
        let Some((decoded, _)) = self.decoded_frame(&image_id) else {
            return 0;
        };
        let (width, height) = (decoded.width, decoded.height);
        let Some(labelmap) = self.labelmaps.get_mut(&layer_id) else {
            log::debug!("brush ignored: no labelmap for layer {layer_id}");
            return 0;
        };
        let (_, mask) = labelmap
            .slices
            .entry(image_id)
            .or_insert_with(|| (slice_index, Mask::new(width, height)));
        mask.paint_disc(center, radius, value)
    }

    fn complete_annotation(
        &mut self,
        stroke: Stroke,
        tool_type: ToolType,
    ) -> Option<StrokeOutcome> {
        let geometry = shape_geometry(tool_type, &stroke.points)?;
        let element = self.element(stroke.viewport_index)?;
        let image_id = element.image_id()?.to_string();
        let mut shape = AnnotationShape::draft(tool_type, geometry, element.current, image_id);
        shape.annotator_id = self.annotator_id.clone();
        if let Err(err) = shape.validate() {
            log::debug!("discarding stroke: {err}");
            return None;
        }
        let client_id = shape.client_id.clone();
        let viewport_index = stroke.viewport_index;
        self.add_annotation(viewport_index, RawAnnotation::from_shape(&shape))
            .then_some(StrokeOutcome::Annotation {
                viewport_index,
                client_id,
            })
    }

    fn element(&self, viewport_index: usize) -> Option<&Element> {
        self.elements.get(viewport_index)?.as_ref()
    }

    fn element_mut(&mut self, viewport_index: usize) -> Option<&mut Element> {
        self.elements.get_mut(viewport_index)?.as_mut()
    }

    fn decoded_frame(&self, image_id: &str) -> Option<(&Arc<DicomImage>, usize)> {
        let image = parse_image_id(image_id)?;
        match self.images.get(image.location)? {
            Decoded::Ready(decoded) => {
                let frame = image.frame.unwrap_or(0);
                (frame < decoded.frame_count()).then_some((decoded, frame))
            }
            _ => None,
        }
    }

    fn request_current(&mut self, viewport_index: usize) {
        let Some(image_id) = self.image_id(viewport_index).map(str::to_string) else {
            return;
        };
        let Some(image) = parse_image_id(&image_id) else {
            log::warn!("viewport {viewport_index}: unsupported image id {image_id}");
            return;
        };
        let location = image.location.to_string();
        if self.images.contains_key(&location) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let job = Job::spawn(self.job_mode, format!("decode-{viewport_index}"), move |cancel| {
            let bytes = backend.fetch_image_bytes(&image_id)?;
            if cancel.is_cancelled() {
                bail!("cancelled");
            }
            decode_dicom_bytes(&bytes).with_context(|| format!("Could not decode {image_id}"))
        });
        self.images.insert(location, Decoded::Loading(job));
    }

    /// Drops cached images no stack refers to any more.
    fn prune_images(&mut self) {
        let referenced: HashSet<&str> = self
            .elements
            .iter()
            .flatten()
            .flat_map(|element| element.stack.image_ids.iter())
            .filter_map(|image_id| parse_image_id(image_id).map(|image| image.location))
            .collect();
        self.images
            .retain(|location, _| referenced.contains(location.as_str()));
    }

    #[cfg(test)]
    fn insert_decoded(&mut self, location: &str, image: DicomImage) {
        self.images
            .insert(location.to_string(), Decoded::Ready(Arc::new(image)));
    }
}

/// Handle points a tool keeps from the raw drag samples.
fn shape_geometry(tool_type: ToolType, points: &[Point]) -> Option<Vec<Point>> {
    let first = *points.first()?;
    let last = *points.last()?;
    let geometry = match tool_type {
        ToolType::Probe => vec![last],
        ToolType::Length
        | ToolType::RectangleRoi
        | ToolType::EllipticalRoi
        | ToolType::ArrowAnnotate => {
            if first.distance_to(last) < MIN_DRAG {
                return None;
            }
            vec![first, last]
        }
        ToolType::Angle => vec![first, points[points.len() / 2], last],
        ToolType::FreehandRoi => points.to_vec(),
    };
    (geometry.len() >= tool_type.min_points()).then_some(geometry)
}

impl RenderingEngine for LocalEngine {
    fn is_enabled(&self, viewport_index: usize) -> bool {
        self.element(viewport_index).is_some()
    }

    fn element_generation(&self, viewport_index: usize) -> Option<u64> {
        self.element(viewport_index).map(|element| element.generation)
    }

    fn loaded_image_count(&self, viewport_index: usize) -> Option<usize> {
        let element = self.element(viewport_index)?;
        (!element.stack.is_empty()).then_some(element.stack.len())
    }

    fn display_frame(&mut self, viewport_index: usize, frame_index: usize) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        if frame_index >= element.stack.len() {
            return false;
        }
        if element.current != frame_index {
            element.current = frame_index;
            self.revision += 1;
        }
        self.request_current(viewport_index);
        true
    }

    fn view_transform(&self, viewport_index: usize) -> Option<ViewTransform> {
        let element = self.element(viewport_index)?;
        let (decoded, _) = self.decoded_frame(element.image_id()?)?;
        let (width, height) = element.viewport_size;
        let mut transform =
            ViewTransform::fit(decoded.width as f32, decoded.height as f32, width, height);
        transform.zoom = element.zoom;
        transform.pan = element.pan;
        transform.rotation = element.rotation;
        transform.flip_horizontal = element.flip_horizontal;
        transform.flip_vertical = element.flip_vertical;
        Some(transform)
    }

    fn tool_types(&self, viewport_index: usize) -> Vec<ToolType> {
        let Some(element) = self.element(viewport_index) else {
            return Vec::new();
        };
        let mut tools: Vec<ToolType> =
            element.annotations.iter().map(|raw| raw.tool_type).collect();
        tools.sort();
        tools.dedup();
        tools
    }

    fn raw_annotations(&self, viewport_index: usize, tool_type: ToolType) -> Vec<RawAnnotation> {
        self.element(viewport_index)
            .map(|element| {
                element
                    .annotations
                    .iter()
                    .filter(|raw| raw.tool_type == tool_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn annotation(&self, viewport_index: usize, client_id: &str) -> Option<RawAnnotation> {
        self.element(viewport_index)?
            .annotations
            .iter()
            .find(|raw| raw.client_id == client_id)
            .cloned()
    }

    fn add_annotation(&mut self, viewport_index: usize, annotation: RawAnnotation) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        match element
            .annotations
            .iter_mut()
            .find(|raw| raw.client_id == annotation.client_id)
        {
            Some(existing) => *existing = annotation,
            None => element.annotations.push(annotation),
        }
        self.revision += 1;
        true
    }

    fn set_correlation_id(
        &mut self,
        viewport_index: usize,
        client_id: &str,
        persisted_id: &str,
    ) -> bool {
        let Some(raw) = self.element_mut(viewport_index).and_then(|element| {
            element
                .annotations
                .iter_mut()
                .find(|raw| raw.client_id == client_id)
        }) else {
            return false;
        };
        raw.correlation_id = Some(persisted_id.to_string());
        true
    }

    fn remove_annotation(&mut self, viewport_index: usize, client_id: &str) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        let before = element.annotations.len();
        element.annotations.retain(|raw| raw.client_id != client_id);
        let removed = element.annotations.len() != before;
        if removed {
            self.revision += 1;
        }
        removed
    }

    fn clear_annotations(&mut self, viewport_index: usize) -> usize {
        let Some(element) = self.element_mut(viewport_index) else {
            return 0;
        };
        let removed = std::mem::take(&mut element.annotations).len();
        if removed > 0 {
            self.revision += 1;
        }
        removed
    }

    fn rotate(&mut self, viewport_index: usize, quarter_turns: i32) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        element.rotation = (i32::from(element.rotation) + quarter_turns).rem_euclid(4) as u8;
        self.revision += 1;
        true
    }

    /// Flips along the screen axis, which is the other image axis while the
    /// view is turned a quarter.
    fn flip(&mut self, viewport_index: usize, axis: FlipAxis) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        let image_axis = match (axis, element.rotation % 2 == 1) {
            (FlipAxis::Horizontal, false) | (FlipAxis::Vertical, true) => FlipAxis::Horizontal,
            (FlipAxis::Vertical, false) | (FlipAxis::Horizontal, true) => FlipAxis::Vertical,
        };
        match image_axis {
            FlipAxis::Horizontal => element.flip_horizontal = !element.flip_horizontal,
            FlipAxis::Vertical => element.flip_vertical = !element.flip_vertical,
        }
        self.revision += 1;
        true
    }

    fn reset_view(&mut self, viewport_index: usize) -> bool {
        let Some(element) = self.element_mut(viewport_index) else {
            return false;
        };
        element.reset_view();
        self.revision += 1;
        true
    }

    fn attach_labelmap(&mut self, layer_id: u64, snapshots: &[LabelmapSnapshot]) {
        let visible = self
            .labelmaps
            .get(&layer_id)
            .map_or(true, |existing| existing.visible);
        let mut labelmap = LayerLabelmap {
            visible,
            slices: BTreeMap::new(),
        };
        for snapshot in snapshots {
            match Mask::decode(&snapshot.labelmap) {
                Ok(mask) => {
                    labelmap
                        .slices
                        .insert(snapshot.image_ref.clone(), (snapshot.slice_index, mask));
                }
                Err(err) => log::warn!(
                    "layer {layer_id}: skipping labelmap for slice {}: {err:#}",
                    snapshot.slice_index
                ),
            }
        }
        self.labelmaps.insert(layer_id, labelmap);
        self.revision += 1;
    }

    fn set_labelmap_visible(&mut self, layer_id: u64, visible: bool) {
        if let Some(labelmap) = self.labelmaps.get_mut(&layer_id) {
            if labelmap.visible != visible {
                labelmap.visible = visible;
                self.revision += 1;
            }
        }
    }

    fn remove_labelmap(&mut self, layer_id: u64) {
        if self.labelmaps.remove(&layer_id).is_some() {
            self.revision += 1;
        }
        if matches!(
            self.stroke.as_ref().map(|stroke| stroke.tool),
            Some(ActiveTool::Brush { layer_id: painting, .. }) if painting == layer_id
        ) {
            self.stroke = None;
        }
    }
}
