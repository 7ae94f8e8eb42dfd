use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ViewerError, ViewerResult};
use crate::geometry::{Bounds, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ToolType {
    Length,
    Probe,
    RectangleRoi,
    EllipticalRoi,
    Angle,
    ArrowAnnotate,
    FreehandRoi,
}

impl ToolType {
    pub const ALL: [ToolType; 7] = [
        ToolType::Length,
        ToolType::Probe,
        ToolType::RectangleRoi,
        ToolType::EllipticalRoi,
        ToolType::Angle,
        ToolType::ArrowAnnotate,
        ToolType::FreehandRoi,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Length => "Length",
            Self::Probe => "Probe",
            Self::RectangleRoi => "Rectangle",
            Self::EllipticalRoi => "Ellipse",
            Self::Angle => "Angle",
            Self::ArrowAnnotate => "Arrow",
            Self::FreehandRoi => "Freehand",
        }
    }

    pub fn min_points(self) -> usize {
        match self {
            Self::Probe => 1,
            Self::Length | Self::RectangleRoi | Self::EllipticalRoi | Self::ArrowAnnotate => 2,
            Self::Angle | Self::FreehandRoi => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum AnnotationStatus {
    Draft,
    Persisted { persisted_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationStyle {
    pub color_code: String,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            color_code: "#f5c518".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationShape {
    pub client_id: String,
    pub tool_type: ToolType,
    /// Image-space points, never empty.
    pub geometry: Vec<Point>,
    pub slice_index: usize,
    pub referenced_image_ref: String,
    pub status: AnnotationStatus,
    pub style: AnnotationStyle,
    pub text_content: Option<String>,
    pub annotator_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Image-space rectangle of the rendered text label, if any.
    pub text_box: Option<Bounds>,
}

impl AnnotationShape {
    pub fn draft(
        tool_type: ToolType,
        geometry: Vec<Point>,
        slice_index: usize,
        referenced_image_ref: impl Into<String>,
    ) -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            tool_type,
            geometry,
            slice_index,
            referenced_image_ref: referenced_image_ref.into(),
            status: AnnotationStatus::Draft,
            style: AnnotationStyle::default(),
            text_content: None,
            annotator_id: None,
            reviewer_id: None,
            created_at: Some(Utc::now()),
            updated_at: None,
            text_box: None,
        }
    }

    pub fn persisted_id(&self) -> Option<&str> {
        match &self.status {
            AnnotationStatus::Persisted { persisted_id } => Some(persisted_id),
            AnnotationStatus::Draft => None,
        }
    }

    pub fn is_draft(&self) -> bool {
        matches!(self.status, AnnotationStatus::Draft)
    }

    /// Draft -> persisted. Persisted shapes never go back to draft.
    pub fn promote(&mut self, persisted_id: String) -> ViewerResult<()> {
        if let Some(existing) = self.persisted_id() {
            return Err(ViewerError::InvalidTransition(format!(
                "annotation {} is already persisted as {existing}",
                self.client_id
            )));
        }
        self.status = AnnotationStatus::Persisted { persisted_id };
        self.updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(&self.geometry)
    }

    pub fn validate(&self) -> ViewerResult<()> {
        let reason = if self.geometry.is_empty() {
            Some("no handle points".to_string())
        } else if self.geometry.iter().any(|point| !point.is_finite()) {
            Some("non-finite handle point".to_string())
        } else if self.geometry.len() < self.tool_type.min_points() {
            Some(format!(
                "{} needs {} points, has {}",
                self.tool_type.label(),
                self.tool_type.min_points(),
                self.geometry.len()
            ))
        } else {
            None
        };
        match reason {
            Some(reason) => Err(ViewerError::Geometry {
                client_id: self.client_id.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Short measurement text for labels and tooltips.
    pub fn measurement(&self) -> Option<String> {
        match self.tool_type {
            ToolType::Length => {
                let [a, b, ..] = self.geometry.as_slice() else {
                    return None;
                };
                Some(format!("{:.1} px", a.distance_to(*b)))
            }
            ToolType::RectangleRoi | ToolType::EllipticalRoi => {
                let bounds = self.bounds()?;
                let area = if self.tool_type == ToolType::EllipticalRoi {
                    std::f32::consts::PI * bounds.width() * bounds.height() / 4.0
                } else {
                    bounds.area()
                };
                Some(format!("{area:.0} px²"))
            }
            ToolType::Angle => {
                let [a, vertex, c, ..] = self.geometry.as_slice() else {
                    return None;
                };
                let first = (a.y - vertex.y).atan2(a.x - vertex.x);
                let second = (c.y - vertex.y).atan2(c.x - vertex.x);
                let mut degrees = (first - second).abs().to_degrees();
                if degrees > 180.0 {
                    degrees = 360.0 - degrees;
                }
                Some(format!("{degrees:.1}°"))
            }
            _ => None,
        }
    }
}

/// Annotation record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedAnnotation {
    pub id: String,
    pub series_id: String,
    pub slice_index: usize,
    pub tool_type: ToolType,
    /// Image-space handle points, as posted by `NewAnnotation`.
    #[serde(default)]
    pub points: Vec<Point>,
    #[serde(default)]
    pub referenced_image_ref: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub annotator_id: Option<String>,
    #[serde(default)]
    pub reviewer_id: Option<String>,
    #[serde(default)]
    pub color_code: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body posted when saving a draft.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAnnotation {
    pub series_id: String,
    pub slice_index: usize,
    pub tool_type: ToolType,
    pub referenced_image_ref: String,
    pub points: Vec<Point>,
    pub color_code: String,
    pub label: Option<String>,
    pub annotator_id: Option<String>,
}

impl NewAnnotation {
    pub fn from_shape(series_id: &str, shape: &AnnotationShape) -> Self {
        Self {
            series_id: series_id.to_string(),
            slice_index: shape.slice_index,
            tool_type: shape.tool_type,
            referenced_image_ref: shape.referenced_image_ref.clone(),
            points: shape.geometry.clone(),
            color_code: shape.style.color_code.clone(),
            label: shape.text_content.clone(),
            annotator_id: shape.annotator_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_code: Option<String>,
}

/// What the hover and detail panels show: engine data, upgraded with the
/// persisted record once it is known.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationDetails {
    pub client_id: String,
    pub persisted_id: Option<String>,
    pub tool_type: ToolType,
    pub slice_index: usize,
    pub label: Option<String>,
    pub measurement: Option<String>,
    pub color_code: String,
    pub annotator_id: Option<String>,
    pub reviewer_id: Option<String>,
    pub status: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub enriched: bool,
}

impl AnnotationDetails {
    pub fn from_shape(shape: &AnnotationShape) -> Self {
        Self {
            client_id: shape.client_id.clone(),
            persisted_id: shape.persisted_id().map(str::to_string),
            tool_type: shape.tool_type,
            slice_index: shape.slice_index,
            label: shape.text_content.clone(),
            measurement: shape.measurement(),
            color_code: shape.style.color_code.clone(),
            annotator_id: shape.annotator_id.clone(),
            reviewer_id: shape.reviewer_id.clone(),
            status: Some(draft_label(shape).to_string()),
            notes: None,
            created_at: shape.created_at,
            updated_at: shape.updated_at,
            enriched: false,
        }
    }

    pub fn enrich(&mut self, record: &PersistedAnnotation) {
        self.persisted_id = Some(record.id.clone());
        if record.label.is_some() {
            self.label = record.label.clone();
        }
        if let Some(color) = record.color_code.as_ref() {
            self.color_code = color.clone();
        }
        self.annotator_id = record.annotator_id.clone().or(self.annotator_id.take());
        self.reviewer_id = record.reviewer_id.clone().or(self.reviewer_id.take());
        self.status = record.status.clone().or(self.status.take());
        self.notes = record.notes.clone();
        self.created_at = record.created_at.or(self.created_at);
        self.updated_at = record.updated_at.or(self.updated_at);
        self.enriched = true;
    }
}

fn draft_label(shape: &AnnotationShape) -> &'static str {
    if shape.is_draft() {
        "draft"
    } else {
        "persisted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> AnnotationShape {
        AnnotationShape::draft(
            ToolType::Length,
            vec![Point::new(0.0, 0.0), Point::new(3.0, 4.0)],
            2,
            "wadouri:a.dcm",
        )
    }

    #[test]
    fn draft_has_no_persisted_id_until_promoted() {
        let mut shape = line();
        assert!(shape.is_draft());
        assert_eq!(shape.persisted_id(), None);

        shape.promote("db-7".to_string()).expect("draft promotes");
        assert_eq!(shape.persisted_id(), Some("db-7"));
        assert!(matches!(
            shape.promote("db-8".to_string()),
            Err(ViewerError::InvalidTransition(_))
        ));
        assert_eq!(shape.persisted_id(), Some("db-7"));
    }

    #[test]
    fn validation_rejects_malformed_geometry() {
        let mut shape = line();
        assert!(shape.validate().is_ok());

        shape.geometry.truncate(1);
        assert!(matches!(shape.validate(), Err(ViewerError::Geometry { .. })));

        shape.geometry.clear();
        assert!(shape.validate().is_err());

        shape.geometry = vec![Point::new(f32::NAN, 0.0), Point::new(1.0, 1.0)];
        assert!(shape.validate().is_err());
    }

    #[test]
    fn length_measurement_uses_image_distance() {
        assert_eq!(line().measurement().as_deref(), Some("5.0 px"));
    }

    #[test]
    fn right_angle_measures_ninety_degrees() {
        let shape = AnnotationShape::draft(
            ToolType::Angle,
            vec![Point::new(10.0, 0.0), Point::new(0.0, 0.0), Point::new(0.0, 10.0)],
            0,
            "wadouri:a.dcm",
        );
        assert_eq!(shape.measurement().as_deref(), Some("90.0°"));
    }

    #[test]
    fn enrich_prefers_persisted_metadata() {
        let shape = line();
        let mut details = AnnotationDetails::from_shape(&shape);
        assert!(!details.enriched);
        details.enrich(&PersistedAnnotation {
            id: "db-1".to_string(),
            series_id: "s".to_string(),
            slice_index: 2,
            tool_type: ToolType::Length,
            points: Vec::new(),
            referenced_image_ref: None,
            status: Some("reviewed".to_string()),
            annotator_id: Some("dr-a".to_string()),
            reviewer_id: None,
            color_code: Some("#ff0000".to_string()),
            notes: Some("check follow-up".to_string()),
            label: None,
            created_at: None,
            updated_at: None,
        });
        assert!(details.enriched);
        assert_eq!(details.persisted_id.as_deref(), Some("db-1"));
        assert_eq!(details.color_code, "#ff0000");
        assert_eq!(details.status.as_deref(), Some("reviewed"));
        assert_eq!(details.measurement.as_deref(), Some("5.0 px"));
    }

    #[test]
    fn persisted_record_parses_backend_json() {
        let record: PersistedAnnotation = serde_json::from_str(
            r#"{"id":"9","seriesId":"s","sliceIndex":4,"toolType":"rectangleRoi",
                "createdAt":"2024-03-01T10:00:00Z","notes":null}"#,
        )
        .expect("record should parse");
        assert_eq!(record.tool_type, ToolType::RectangleRoi);
        assert_eq!(record.slice_index, 4);
        assert!(record.created_at.is_some());
        assert!(record.points.is_empty());

        let drawn: PersistedAnnotation = serde_json::from_str(
            r#"{"id":"10","seriesId":"s","sliceIndex":1,"toolType":"length",
                "points":[{"x":1.0,"y":2.0},{"x":5.0,"y":2.0}],
                "referencedImageRef":"wadouri:files/a.dcm"}"#,
        )
        .expect("record with geometry should parse");
        assert_eq!(drawn.points, vec![Point::new(1.0, 2.0), Point::new(5.0, 2.0)]);
        assert_eq!(drawn.referenced_image_ref.as_deref(), Some("wadouri:files/a.dcm"));
    }
}
