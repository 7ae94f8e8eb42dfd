use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const WADO_URI_PREFIX: &str = "wadouri:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesId(pub String);

impl SeriesId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum SeriesSource {
    Backend,
    LocalFiles { paths: Vec<PathBuf> },
}

/// What the drag payload channel carries and what a viewport binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesDescriptor {
    pub id: SeriesId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub modality: Option<String>,
    #[serde(default)]
    pub study_uid: Option<String>,
    /// Instance count as reported by the backend. Not authoritative for the
    /// stack length, see `navigation::reconcile_stack_length`.
    #[serde(default)]
    pub reported_instance_count: Option<usize>,
    /// Length of the image stack once its instances have been listed.
    #[serde(default)]
    pub stack_length: Option<usize>,
    #[serde(default = "default_source")]
    pub source: SeriesSource,
}

fn default_source() -> SeriesSource {
    SeriesSource::Backend
}

impl SeriesDescriptor {
    pub fn from_backend(id: impl Into<String>) -> Self {
        Self {
            id: SeriesId::new(id),
            description: String::new(),
            modality: None,
            study_uid: None,
            reported_instance_count: None,
            stack_length: None,
            source: SeriesSource::Backend,
        }
    }

    pub fn from_local_paths(paths: Vec<PathBuf>) -> Self {
        let id = local_series_id(&paths);
        let description = paths
            .first()
            .and_then(|path| path.parent())
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "Local files".to_string());
        Self {
            id: SeriesId::new(id),
            description,
            modality: None,
            study_uid: None,
            reported_instance_count: Some(paths.len()),
            stack_length: None,
            source: SeriesSource::LocalFiles { paths },
        }
    }

    pub fn label(&self) -> String {
        let name = if self.description.trim().is_empty() {
            self.id.as_str()
        } else {
            self.description.as_str()
        };
        match self.modality.as_deref() {
            Some(modality) if !modality.is_empty() => format!("{modality} · {name}"),
            _ => name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    #[serde(default)]
    pub sop_instance_uid: Option<String>,
    pub file_path: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default = "default_frame_count")]
    pub frame_count: usize,
}

fn default_frame_count() -> usize {
    1
}

/// Ordered image ids addressable by the rendering engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageStack {
    pub series_id: SeriesId,
    pub image_ids: Vec<String>,
}

impl ImageStack {
    pub fn from_instances(series_id: SeriesId, instances: &[InstanceRecord]) -> Self {
        let mut image_ids = Vec::new();
        for instance in instances {
            let base = format!("{WADO_URI_PREFIX}{}", instance.file_path);
            if instance.frame_count > 1 {
                for frame in 0..instance.frame_count {
                    image_ids.push(format!("{base}?frame={frame}"));
                }
            } else {
                image_ids.push(base);
            }
        }
        Self {
            series_id,
            image_ids,
        }
    }

    pub fn len(&self) -> usize {
        self.image_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_ids.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub location: &'a str,
    pub frame: Option<usize>,
}

pub fn parse_image_id(image_id: &str) -> Option<ImageRef<'_>> {
    let rest = image_id.strip_prefix(WADO_URI_PREFIX)?;
    let (location, frame) = match rest.rsplit_once("?frame=") {
        Some((location, frame)) => (location, frame.parse::<usize>().ok()),
        None => (rest, None),
    };
    if location.is_empty() {
        return None;
    }
    Some(ImageRef { location, frame })
}

pub fn encode_drag_payload(series: &SeriesDescriptor) -> Result<String, serde_json::Error> {
    serde_json::to_string(series)
}

pub fn decode_drag_payload(payload: &str) -> Result<SeriesDescriptor, serde_json::Error> {
    serde_json::from_str(payload)
}

fn local_series_id(paths: &[PathBuf]) -> String {
    let mut normalized = paths
        .iter()
        .map(|path| path.to_string_lossy().to_string())
        .collect::<Vec<_>>();
    normalized.sort();
    format!("local:{}:{}", normalized.len(), normalized.join("|"))
}
