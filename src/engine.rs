use chrono::{DateTime, Utc};

use crate::annotation::{
    AnnotationShape, AnnotationStatus, AnnotationStyle, PersistedAnnotation, ToolType,
};
use crate::error::{ViewerError, ViewerResult};
use crate::geometry::{Bounds, Point, ViewTransform};
use crate::segmentation::LabelmapSnapshot;

/// An annotation as the rendering engine keeps it in memory. Handles can be
/// missing while a tool is mid-edit or after a bad deserialization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAnnotation {
    pub client_id: String,
    pub tool_type: ToolType,
    pub handles: Vec<Option<Point>>,
    pub slice_index: Option<usize>,
    pub referenced_image_id: Option<String>,
    /// Backend id embedded once the annotation has been saved or loaded.
    pub correlation_id: Option<String>,
    pub color_code: Option<String>,
    pub text: Option<String>,
    pub text_box: Option<Bounds>,
    pub annotator_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RawAnnotation {
    pub fn from_shape(shape: &AnnotationShape) -> Self {
        Self {
            client_id: shape.client_id.clone(),
            tool_type: shape.tool_type,
            handles: shape.geometry.iter().copied().map(Some).collect(),
            slice_index: Some(shape.slice_index),
            referenced_image_id: Some(shape.referenced_image_ref.clone()),
            correlation_id: shape.persisted_id().map(str::to_string),
            color_code: Some(shape.style.color_code.clone()),
            text: shape.text_content.clone(),
            text_box: shape.text_box,
            annotator_id: shape.annotator_id.clone(),
            reviewer_id: shape.reviewer_id.clone(),
            created_at: shape.created_at,
            updated_at: shape.updated_at,
        }
    }

    /// Engine copy of a backend record under a fresh client id. A record
    /// without an image reference stays addressable by slice only.
    pub fn from_record(record: &PersistedAnnotation) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            tool_type: record.tool_type,
            handles: record.points.iter().copied().map(Some).collect(),
            slice_index: Some(record.slice_index),
            referenced_image_id: Some(record.referenced_image_ref.clone().unwrap_or_default()),
            correlation_id: Some(record.id.clone()),
            color_code: record.color_code.clone(),
            text: record.label.clone(),
            text_box: None,
            annotator_id: record.annotator_id.clone(),
            reviewer_id: record.reviewer_id.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    pub fn to_shape(&self) -> ViewerResult<AnnotationShape> {
        let malformed = |reason: &str| ViewerError::Geometry {
            client_id: self.client_id.clone(),
            reason: reason.to_string(),
        };
        let geometry = self
            .handles
            .iter()
            .copied()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| malformed("missing handle"))?;
        let slice_index = self.slice_index.ok_or_else(|| malformed("missing slice index"))?;
        let referenced_image_ref = self
            .referenced_image_id
            .clone()
            .ok_or_else(|| malformed("missing referenced image"))?;

        let shape = AnnotationShape {
            client_id: self.client_id.clone(),
            tool_type: self.tool_type,
            geometry,
            slice_index,
            referenced_image_ref,
            status: match &self.correlation_id {
                Some(persisted_id) => AnnotationStatus::Persisted {
                    persisted_id: persisted_id.clone(),
                },
                None => AnnotationStatus::Draft,
            },
            style: self
                .color_code
                .clone()
                .map(|color_code| AnnotationStyle { color_code })
                .unwrap_or_default(),
            text_content: self.text.clone(),
            annotator_id: self.annotator_id.clone(),
            reviewer_id: self.reviewer_id.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            text_box: self.text_box,
        };
        shape.validate()?;
        Ok(shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipAxis {
    Horizontal,
    Vertical,
}

/// The only surface through which coordination code touches the rendering
/// engine's process-wide stores. Viewports are addressed by grid index.
pub trait RenderingEngine {
    fn is_enabled(&self, viewport_index: usize) -> bool;

    /// Generation of the binding the viewport's element was enabled for.
    fn element_generation(&self, viewport_index: usize) -> Option<u64>;

    /// Number of images the engine actually holds for the viewport's stack,
    /// `None` while the stack is still loading.
    fn loaded_image_count(&self, viewport_index: usize) -> Option<usize>;

    fn display_frame(&mut self, viewport_index: usize, frame_index: usize) -> bool;

    fn view_transform(&self, viewport_index: usize) -> Option<ViewTransform>;

    /// Tool types that currently have state on the viewport's element.
    fn tool_types(&self, viewport_index: usize) -> Vec<ToolType>;

    fn raw_annotations(&self, viewport_index: usize, tool_type: ToolType) -> Vec<RawAnnotation>;

    fn annotation(&self, viewport_index: usize, client_id: &str) -> Option<RawAnnotation>;

    fn add_annotation(&mut self, viewport_index: usize, annotation: RawAnnotation) -> bool;

    /// Embeds a backend id in the engine record. Returns false if the record vanished.
    fn set_correlation_id(
        &mut self,
        viewport_index: usize,
        client_id: &str,
        persisted_id: &str,
    ) -> bool;

    fn remove_annotation(&mut self, viewport_index: usize, client_id: &str) -> bool;

    fn clear_annotations(&mut self, viewport_index: usize) -> usize;

    fn rotate(&mut self, viewport_index: usize, quarter_turns: i32) -> bool;

    fn flip(&mut self, viewport_index: usize, axis: FlipAxis) -> bool;

    fn reset_view(&mut self, viewport_index: usize) -> bool;

    /// Creates (or replaces) the labelmap backing a segmentation layer.
    fn attach_labelmap(&mut self, layer_id: u64, snapshots: &[LabelmapSnapshot]);

    fn set_labelmap_visible(&mut self, layer_id: u64, visible: bool);

    fn remove_labelmap(&mut self, layer_id: u64);
}

pub fn require_element(engine: &dyn RenderingEngine, viewport_index: usize) -> ViewerResult<()> {
    if engine.is_enabled(viewport_index) {
        Ok(())
    } else {
        Err(ViewerError::EngineAbsent(viewport_index))
    }
}

/// Every well-formed shape across all tool types on a viewport. Malformed
/// records are skipped one by one.
pub fn collect_shapes(engine: &dyn RenderingEngine, viewport_index: usize) -> Vec<AnnotationShape> {
    if let Err(err) = require_element(engine, viewport_index) {
        log::warn!("annotation enumeration skipped: {err}");
        return Vec::new();
    }
    let mut shapes = Vec::new();
    for tool_type in engine.tool_types(viewport_index) {
        for raw in engine.raw_annotations(viewport_index, tool_type) {
            match raw.to_shape() {
                Ok(shape) => shapes.push(shape),
                Err(err) => log::debug!("skipping annotation: {err}"),
            }
        }
    }
    shapes
}

pub fn shapes_on_slice(
    engine: &dyn RenderingEngine,
    viewport_index: usize,
    slice_index: usize,
) -> Vec<AnnotationShape> {
    let mut shapes = collect_shapes(engine, viewport_index);
    shapes.retain(|shape| shape.slice_index == slice_index);
    shapes
}


#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;

    fn shape(slice: usize) -> AnnotationShape {
        AnnotationShape::draft(
            ToolType::Length,
            vec![Point::new(1.0, 1.0), Point::new(5.0, 5.0)],
            slice,
            "wadouri:a.dcm",
        )
    }

    #[test]
    fn missing_handle_is_a_geometry_error() {
        let mut raw = RawAnnotation::from_shape(&shape(0));
        raw.handles[1] = None;
        assert!(matches!(raw.to_shape(), Err(ViewerError::Geometry { .. })));
    }

    #[test]
    fn correlation_id_marks_shape_persisted() {
        let mut raw = RawAnnotation::from_shape(&shape(0));
        raw.correlation_id = Some("db-3".to_string());
        assert_eq!(raw.to_shape().expect("valid").persisted_id(), Some("db-3"));
    }

    #[test]
    fn collect_skips_malformed_records_individually() {
        let mut engine = FakeEngine::with_viewports(&[0]);
        engine.insert(0, &shape(0));
        let mut broken = RawAnnotation::from_shape(&shape(0));
        broken.handles.clear();
        engine.add_annotation(0, broken);
        engine.insert(0, &shape(1));

        assert_eq!(collect_shapes(&engine, 0).len(), 2);
        assert_eq!(shapes_on_slice(&engine, 0, 1).len(), 1);
    }

    #[test]
    fn backend_record_becomes_persisted_shape() {
        let record = PersistedAnnotation {
            id: "db-5".to_string(),
            series_id: "s".to_string(),
            slice_index: 3,
            tool_type: ToolType::Length,
            points: vec![Point::new(1.0, 1.0), Point::new(4.0, 5.0)],
            referenced_image_ref: Some("wadouri:files/b.dcm".to_string()),
            status: None,
            annotator_id: Some("dr-a".to_string()),
            reviewer_id: None,
            color_code: Some("#00ff00".to_string()),
            notes: None,
            label: Some("lesion".to_string()),
            created_at: None,
            updated_at: None,
        };
        let shape = RawAnnotation::from_record(&record).to_shape().expect("drawable");
        assert_eq!(shape.persisted_id(), Some("db-5"));
        assert_eq!(shape.slice_index, 3);
        assert_eq!(shape.style.color_code, "#00ff00");
        assert_eq!(shape.text_content.as_deref(), Some("lesion"));

        let bare = PersistedAnnotation {
            points: Vec::new(),
            ..record
        };
        assert!(RawAnnotation::from_record(&bare).to_shape().is_err());
    }

    #[test]
    fn absent_element_yields_nothing() {
        let mut engine = FakeEngine::with_viewports(&[0]);
        engine.insert(3, &shape(0));
        assert!(collect_shapes(&engine, 3).is_empty());
        assert!(matches!(
            require_element(&engine, 3),
            Err(ViewerError::EngineAbsent(3))
        ));
    }
}
