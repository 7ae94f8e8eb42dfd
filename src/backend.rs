use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::ACCEPT;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::annotation::{AnnotationPatch, NewAnnotation, PersistedAnnotation};
use crate::segmentation::{LayerMetadata, LayerRecord, NewLayer};
use crate::series::{parse_image_id, InstanceRecord, SeriesDescriptor, SeriesId};

/// The hospital backend as seen by the viewer. Implementations are shared
/// with background jobs, hence `Send + Sync`.
pub trait Backend: Send + Sync {
    fn fetch_series(&self, series_id: &SeriesId) -> Result<SeriesDescriptor>;

    fn list_instances(&self, series_id: &SeriesId) -> Result<Vec<InstanceRecord>>;

    fn list_annotations(&self, series_id: &SeriesId) -> Result<Vec<PersistedAnnotation>>;

    fn create_annotation(
        &self,
        series_id: &SeriesId,
        annotation: &NewAnnotation,
    ) -> Result<PersistedAnnotation>;

    fn update_annotation(
        &self,
        annotation_id: &str,
        patch: &AnnotationPatch,
    ) -> Result<PersistedAnnotation>;

    fn delete_annotation(&self, annotation_id: &str) -> Result<()>;

    fn list_layers(&self, series_id: &SeriesId) -> Result<Vec<LayerRecord>>;

    fn create_layer(&self, series_id: &SeriesId, layer: &NewLayer) -> Result<LayerRecord>;

    fn update_layer(&self, record_id: &str, metadata: &LayerMetadata) -> Result<LayerRecord>;

    fn delete_layer(&self, record_id: &str) -> Result<()>;

    /// Raw DICOM bytes behind a `wadouri:` image id.
    fn fetch_image_bytes(&self, image_id: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct HttpBackend {
    client: Client,
    base: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base = normalize_base_url(&config.base_url);
        if base.is_empty() {
            bail!("Backend URL is empty");
        }
        Ok(Self {
            client: build_http_client()?,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.username.as_deref() {
            Some(username) => request.basic_auth(username, self.password.as_deref()),
            None => request,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let request = self.authorize(self.client.get(&url).header(ACCEPT, "application/json"));
        let response = send_checked(request, "GET", &url)?;
        response
            .json::<T>()
            .with_context(|| format!("Could not decode JSON response from {url}"))
    }

    fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(path);
        let label = method.to_string();
        let request = self.authorize(
            self.client
                .request(method, &url)
                .header(ACCEPT, "application/json")
                .json(body),
        );
        let response = send_checked(request, &label, &url)?;
        response
            .json::<T>()
            .with_context(|| format!("Could not decode JSON response from {url}"))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let url = self.url(path);
        let request = self.authorize(self.client.delete(&url));
        send_checked(request, "DELETE", &url)?;
        Ok(())
    }

    fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let request = self.authorize(self.client.get(url).header(ACCEPT, "application/dicom"));
        let response = send_checked(request, "GET", url)?;
        response
            .bytes()
            .map(|body| body.to_vec())
            .with_context(|| format!("Could not read response body from {url}"))
    }
}

impl Backend for HttpBackend {
    fn fetch_series(&self, series_id: &SeriesId) -> Result<SeriesDescriptor> {
        let mut series: SeriesDescriptor = self
            .get_json(&format!("series/{}", path_segment(series_id.as_str())))
            .with_context(|| format!("Failed fetching series {series_id}"))?;
        series.id = series_id.clone();
        Ok(series)
    }

    fn list_instances(&self, series_id: &SeriesId) -> Result<Vec<InstanceRecord>> {
        self.get_json(&format!(
            "series/{}/instances",
            path_segment(series_id.as_str())
        ))
        .with_context(|| format!("Failed listing instances of series {series_id}"))
    }

    fn list_annotations(&self, series_id: &SeriesId) -> Result<Vec<PersistedAnnotation>> {
        self.get_json(&format!(
            "series/{}/annotations",
            path_segment(series_id.as_str())
        ))
        .with_context(|| format!("Failed fetching annotations of series {series_id}"))
    }

    fn create_annotation(
        &self,
        series_id: &SeriesId,
        annotation: &NewAnnotation,
    ) -> Result<PersistedAnnotation> {
        self.send_json(
            reqwest::Method::POST,
            &format!("series/{}/annotations", path_segment(series_id.as_str())),
            annotation,
        )
        .context("Failed saving annotation")
    }

    fn update_annotation(
        &self,
        annotation_id: &str,
        patch: &AnnotationPatch,
    ) -> Result<PersistedAnnotation> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("annotations/{}", path_segment(annotation_id)),
            patch,
        )
        .with_context(|| format!("Failed updating annotation {annotation_id}"))
    }

    fn delete_annotation(&self, annotation_id: &str) -> Result<()> {
        self.delete(&format!("annotations/{}", path_segment(annotation_id)))
            .with_context(|| format!("Failed deleting annotation {annotation_id}"))
    }

    fn list_layers(&self, series_id: &SeriesId) -> Result<Vec<LayerRecord>> {
        self.get_json(&format!(
            "series/{}/segmentations",
            path_segment(series_id.as_str())
        ))
        .with_context(|| format!("Failed fetching segmentations of series {series_id}"))
    }

    fn create_layer(&self, series_id: &SeriesId, layer: &NewLayer) -> Result<LayerRecord> {
        self.send_json(
            reqwest::Method::POST,
            &format!("series/{}/segmentations", path_segment(series_id.as_str())),
            layer,
        )
        .context("Failed saving segmentation layer")
    }

    fn update_layer(&self, record_id: &str, metadata: &LayerMetadata) -> Result<LayerRecord> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("segmentations/{}", path_segment(record_id)),
            metadata,
        )
        .with_context(|| format!("Failed updating segmentation {record_id}"))
    }

    fn delete_layer(&self, record_id: &str) -> Result<()> {
        self.delete(&format!("segmentations/{}", path_segment(record_id)))
            .with_context(|| format!("Failed deleting segmentation {record_id}"))
    }

    fn fetch_image_bytes(&self, image_id: &str) -> Result<Vec<u8>> {
        let Some(image) = parse_image_id(image_id) else {
            bail!("Unsupported image id {image_id}");
        };
        match resolve_location(&self.base, image.location) {
            ImageLocation::Remote(url) => self.get_bytes(&url),
            ImageLocation::Local(path) => read_local_file(Path::new(&path)),
        }
    }
}

/// Reads images straight from disk. Used when no backend is configured and
/// the user opens local files; every record operation fails.
pub struct OfflineBackend;

impl Backend for OfflineBackend {
    fn fetch_series(&self, series_id: &SeriesId) -> Result<SeriesDescriptor> {
        bail!("No backend configured to fetch series {series_id}")
    }

    fn list_instances(&self, series_id: &SeriesId) -> Result<Vec<InstanceRecord>> {
        bail!("No backend configured to list instances of {series_id}")
    }

    fn list_annotations(&self, _series_id: &SeriesId) -> Result<Vec<PersistedAnnotation>> {
        Ok(Vec::new())
    }

    fn create_annotation(
        &self,
        _series_id: &SeriesId,
        _annotation: &NewAnnotation,
    ) -> Result<PersistedAnnotation> {
        bail!("No backend configured to save annotations")
    }

    fn update_annotation(
        &self,
        _annotation_id: &str,
        _patch: &AnnotationPatch,
    ) -> Result<PersistedAnnotation> {
        bail!("No backend configured to update annotations")
    }

    fn delete_annotation(&self, _annotation_id: &str) -> Result<()> {
        bail!("No backend configured to delete annotations")
    }

    fn list_layers(&self, _series_id: &SeriesId) -> Result<Vec<LayerRecord>> {
        Ok(Vec::new())
    }

    fn create_layer(&self, _series_id: &SeriesId, _layer: &NewLayer) -> Result<LayerRecord> {
        bail!("No backend configured to save segmentation layers")
    }

    fn update_layer(&self, _record_id: &str, _metadata: &LayerMetadata) -> Result<LayerRecord> {
        bail!("No backend configured to update segmentation layers")
    }

    fn delete_layer(&self, _record_id: &str) -> Result<()> {
        bail!("No backend configured to delete segmentation layers")
    }

    fn fetch_image_bytes(&self, image_id: &str) -> Result<Vec<u8>> {
        let Some(image) = parse_image_id(image_id) else {
            bail!("Unsupported image id {image_id}");
        };
        if is_http_url(image.location) {
            bail!("No backend configured to download {}", image.location);
        }
        read_local_file(Path::new(image.location))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ImageLocation {
    Remote(String),
    Local(String),
}

fn resolve_location(base: &str, location: &str) -> ImageLocation {
    if is_http_url(location) {
        return ImageLocation::Remote(location.to_string());
    }
    if Path::new(location).is_absolute() && Path::new(location).exists() {
        return ImageLocation::Local(location.to_string());
    }
    ImageLocation::Remote(format!(
        "{base}/files/{}",
        location.trim_start_matches('/')
    ))
}

fn is_http_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn read_local_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Could not read DICOM file {}", path.display()))
}

fn build_http_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
        .context("Could not initialize HTTP client for backend")
}

pub fn normalize_base_url(base_url: &str) -> String {
    strip_query_and_fragment(base_url.trim())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

fn strip_query_and_fragment(value: &str) -> &str {
    let query_index = value.find('?').unwrap_or(value.len());
    let fragment_index = value.find('#').unwrap_or(value.len());
    &value[..query_index.min(fragment_index)]
}

fn path_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn send_checked(request: RequestBuilder, method: &str, url: &str) -> Result<Response> {
    let response = request
        .send()
        .with_context(|| format!("HTTP {method} failed for {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let detail = response
            .text()
            .unwrap_or_else(|_| String::from("unable to read error body"));
        bail!("HTTP {status} for {method} {url}: {detail}");
    }
    Ok(response)
}

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;

    use super::*;

    /// In-memory backend that counts calls per operation.
    #[derive(Default)]
    pub struct FakeBackend {
        pub annotations: Mutex<HashMap<SeriesId, Vec<PersistedAnnotation>>>,
        pub instances: Mutex<HashMap<SeriesId, Vec<InstanceRecord>>>,
        pub layers: Mutex<Vec<LayerRecord>>,
        pub fail_writes: bool,
        pub fail_reads: bool,
        calls: Mutex<HashMap<&'static str, usize>>,
        next_id: AtomicUsize,
    }

    impl FakeBackend {
        pub fn failing_writes() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }

        pub fn failing_reads() -> Self {
            Self {
                fail_reads: true,
                ..Self::default()
            }
        }

        pub fn calls(&self, operation: &str) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.get(operation).copied().unwrap_or(0))
                .unwrap_or(0)
        }

        pub fn total_calls(&self) -> usize {
            self.calls
                .lock()
                .map(|calls| calls.values().sum())
                .unwrap_or(0)
        }

        fn record(&self, operation: &'static str) {
            if let Ok(mut calls) = self.calls.lock() {
                *calls.entry(operation).or_default() += 1;
            }
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn check_read(&self) -> Result<()> {
            if self.fail_reads {
                return Err(anyhow!("HTTP 503 Service Unavailable"));
            }
            Ok(())
        }

        fn check_write(&self) -> Result<()> {
            if self.fail_writes {
                return Err(anyhow!("HTTP 500 Internal Server Error"));
            }
            Ok(())
        }
    }

    impl Backend for FakeBackend {
        fn fetch_series(&self, series_id: &SeriesId) -> Result<SeriesDescriptor> {
            self.record("fetch_series");
            self.check_read()?;
            Ok(SeriesDescriptor::from_backend(series_id.as_str()))
        }

        fn list_instances(&self, series_id: &SeriesId) -> Result<Vec<InstanceRecord>> {
            self.record("list_instances");
            self.check_read()?;
            Ok(self
                .instances
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .get(series_id)
                .cloned()
                .unwrap_or_default())
        }

        fn list_annotations(&self, series_id: &SeriesId) -> Result<Vec<PersistedAnnotation>> {
            self.record("list_annotations");
            self.check_read()?;
            Ok(self
                .annotations
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .get(series_id)
                .cloned()
                .unwrap_or_default())
        }

        fn create_annotation(
            &self,
            series_id: &SeriesId,
            annotation: &NewAnnotation,
        ) -> Result<PersistedAnnotation> {
            self.record("create_annotation");
            self.check_write()?;
            let record = PersistedAnnotation {
                id: self.next_id("ann"),
                series_id: series_id.to_string(),
                slice_index: annotation.slice_index,
                tool_type: annotation.tool_type,
                points: annotation.points.clone(),
                referenced_image_ref: Some(annotation.referenced_image_ref.clone()),
                status: Some("draft".to_string()),
                annotator_id: annotation.annotator_id.clone(),
                reviewer_id: None,
                color_code: Some(annotation.color_code.clone()),
                notes: None,
                label: annotation.label.clone(),
                created_at: None,
                updated_at: None,
            };
            self.annotations
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .entry(series_id.clone())
                .or_default()
                .push(record.clone());
            Ok(record)
        }

        fn update_annotation(
            &self,
            annotation_id: &str,
            patch: &AnnotationPatch,
        ) -> Result<PersistedAnnotation> {
            self.record("update_annotation");
            self.check_write()?;
            let mut annotations = self.annotations.lock().map_err(|_| anyhow!("poisoned"))?;
            let record = annotations
                .values_mut()
                .flatten()
                .find(|record| record.id == annotation_id)
                .ok_or_else(|| anyhow!("HTTP 404 for annotation {annotation_id}"))?;
            if patch.notes.is_some() {
                record.notes = patch.notes.clone();
            }
            if patch.label.is_some() {
                record.label = patch.label.clone();
            }
            if patch.status.is_some() {
                record.status = patch.status.clone();
            }
            Ok(record.clone())
        }

        fn delete_annotation(&self, _annotation_id: &str) -> Result<()> {
            self.record("delete_annotation");
            self.check_write()
        }

        fn list_layers(&self, series_id: &SeriesId) -> Result<Vec<LayerRecord>> {
            self.record("list_layers");
            self.check_read()?;
            Ok(self
                .layers
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .iter()
                .filter(|layer| layer.series_id == series_id.as_str())
                .cloned()
                .collect())
        }

        fn create_layer(&self, series_id: &SeriesId, layer: &NewLayer) -> Result<LayerRecord> {
            self.record("create_layer");
            self.check_write()?;
            let record = LayerRecord {
                id: self.next_id("seg"),
                series_id: series_id.to_string(),
                name: layer.name.clone(),
                notes: layer.notes.clone(),
                frame: layer.frame,
                snapshots: layer.snapshots.clone(),
                segmentator_id: layer.segmentator_id.clone(),
                reviewer_id: None,
                status: layer.status.clone(),
                color_code: layer.color_code.clone(),
                created_at: None,
                updated_at: None,
            };
            self.layers
                .lock()
                .map_err(|_| anyhow!("poisoned"))?
                .push(record.clone());
            Ok(record)
        }

        fn update_layer(&self, record_id: &str, metadata: &LayerMetadata) -> Result<LayerRecord> {
            self.record("update_layer");
            self.check_write()?;
            let mut layers = self.layers.lock().map_err(|_| anyhow!("poisoned"))?;
            let record = layers
                .iter_mut()
                .find(|record| record.id == record_id)
                .ok_or_else(|| anyhow!("HTTP 404 for segmentation {record_id}"))?;
            if let Some(name) = metadata.name.as_ref() {
                record.name = name.clone();
            }
            if metadata.notes.is_some() {
                record.notes = metadata.notes.clone();
            }
            if let Some(snapshots) = metadata.snapshots.as_ref() {
                record.snapshots = snapshots.clone();
            }
            Ok(record.clone())
        }

        fn delete_layer(&self, _record_id: &str) -> Result<()> {
            self.record("delete_layer");
            self.check_write()
        }

        fn fetch_image_bytes(&self, image_id: &str) -> Result<Vec<u8>> {
            self.record("fetch_image_bytes");
            bail!("no image bytes for {image_id}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_base_url_trims_slashes_and_query() {
        assert_eq!(
            normalize_base_url(" http://pacs.local:8080/api/?token=1 "),
            "http://pacs.local:8080/api"
        );
        assert_eq!(normalize_base_url("   "), "");
    }

    #[test]
    fn relative_wadouri_paths_resolve_under_files_endpoint() {
        assert_eq!(
            resolve_location("http://pacs.local/api", "studies/1/img.dcm"),
            ImageLocation::Remote("http://pacs.local/api/files/studies/1/img.dcm".to_string())
        );
        assert_eq!(
            resolve_location("http://pacs.local/api", "https://cdn.local/x.dcm"),
            ImageLocation::Remote("https://cdn.local/x.dcm".to_string())
        );
    }

    #[test]
    fn existing_absolute_paths_are_read_locally() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("radview-backend-test-{}.dcm", std::process::id()));
        fs::write(&path, b"DICM").expect("temp file should be writable");
        let location = path.to_string_lossy().to_string();
        assert_eq!(
            resolve_location("http://pacs.local/api", &location),
            ImageLocation::Local(location.clone())
        );
        let bytes = OfflineBackend
            .fetch_image_bytes(&format!("wadouri:{location}"))
            .expect("local read should succeed");
        assert_eq!(bytes, b"DICM");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn path_segments_are_percent_encoded() {
        assert_eq!(path_segment("1.2.840/abc def"), "1.2.840%2Fabc%20def");
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let config = BackendConfig {
            base_url: "  ".to_string(),
            username: None,
            password: None,
        };
        assert!(HttpBackend::new(&config).is_err());
    }
}
