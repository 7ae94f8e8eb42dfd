use std::cmp::Ordering;

use crate::annotation::AnnotationShape;
use crate::geometry::{Bounds, Point, ViewTransform};

pub const DEFAULT_HANDLE_RADIUS: f32 = 25.0;
pub const DEFAULT_BOX_PADDING: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitTestConfig {
    /// Display units around each handle point.
    pub handle_radius: f32,
    /// Display units added on every side of a shape's bounding box.
    pub box_padding: f32,
}

impl Default for HitTestConfig {
    fn default() -> Self {
        Self {
            handle_radius: DEFAULT_HANDLE_RADIUS,
            box_padding: DEFAULT_BOX_PADDING,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HitKind {
    Handle { index: usize, distance: f32 },
    BoundingBox,
    TextBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HitMatch<'a> {
    pub shape: &'a AnnotationShape,
    pub enumeration_index: usize,
    pub kind: HitKind,
    /// Display-space anchor for hover UI: the matched handle, or the pointer.
    pub anchor: Point,
    padded_area: f32,
}

impl HitMatch<'_> {
    fn handle_distance(&self) -> f32 {
        match self.kind {
            HitKind::Handle { distance, .. } => distance,
            _ => f32::INFINITY,
        }
    }

    /// Smallest padded box first, then nearest handle, then enumeration order.
    fn priority_cmp(&self, other: &Self) -> Ordering {
        self.padded_area
            .total_cmp(&other.padded_area)
            .then_with(|| self.handle_distance().total_cmp(&other.handle_distance()))
            .then_with(|| self.enumeration_index.cmp(&other.enumeration_index))
    }
}

/// Tests one shape against a display-space pointer position.
pub fn test_shape<'a>(
    config: &HitTestConfig,
    shape: &'a AnnotationShape,
    enumeration_index: usize,
    pointer: Point,
    transform: &ViewTransform,
) -> Option<HitMatch<'a>> {
    let display_points = shape
        .geometry
        .iter()
        .map(|point| transform.image_to_display(*point))
        .collect::<Vec<_>>();
    let padded = if display_points.len() >= 2 {
        Bounds::from_points(&display_points).map(|bounds| bounds.expand(config.box_padding))
    } else {
        None
    };
    let padded_area = padded.map(|bounds| bounds.area()).unwrap_or(0.0);

    let nearest_handle = display_points
        .iter()
        .enumerate()
        .map(|(index, point)| (index, *point, point.distance_to(pointer)))
        .filter(|(_, _, distance)| *distance <= config.handle_radius)
        .min_by(|a, b| a.2.total_cmp(&b.2));

    let (kind, anchor) = if let Some((index, point, distance)) = nearest_handle {
        (HitKind::Handle { index, distance }, point)
    } else if padded.is_some_and(|bounds| bounds.contains(pointer)) {
        (HitKind::BoundingBox, pointer)
    } else if shape
        .text_box
        .map(|text_box| transform.bounds_to_display(&text_box))
        .is_some_and(|text_box| text_box.contains(pointer))
    {
        (HitKind::TextBox, pointer)
    } else {
        return None;
    };

    Some(HitMatch {
        shape,
        enumeration_index,
        kind,
        anchor,
        padded_area,
    })
}

/// Resolves at most one shape under the pointer. Shapes with malformed
/// geometry are skipped without affecting the rest of the batch.
pub fn hit_test<'a>(
    config: &HitTestConfig,
    shapes: &'a [AnnotationShape],
    pointer: Point,
    transform: &ViewTransform,
) -> Option<HitMatch<'a>> {
    shapes
        .iter()
        .enumerate()
        .filter(|(_, shape)| match shape.validate() {
            Ok(()) => true,
            Err(err) => {
                log::debug!("hit-test skipped shape: {err}");
                false
            }
        })
        .filter_map(|(index, shape)| test_shape(config, shape, index, pointer, transform))
        .min_by(HitMatch::priority_cmp)
}
