use crate::config::{Config, STREAM_BUF_SIZE, STREAM_THRESHOLD_BYTES};
use crate::error::{ApiError, ApiResult};
use crate::security;
use crate::tasks::Task;
use crate::zipstream::{self, ZipEntry};
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use walkdir::WalkDir;

/// Logical asset selectors and where they live under a task's assets root.
/// `all` is handled separately as the streamed bundle of the whole tree.
const ASSET_MAP: &[(&str, &str)] = &[
    ("orthophoto", "odm_orthophoto/odm_orthophoto.tif"),
    ("dsm", "odm_dem/dsm.tif"),
    ("dtm", "odm_dem/dtm.tif"),
    ("georeferenced_model", "odm_georeferencing/odm_georeferenced_model.laz"),
    ("report", "odm_report/report.pdf"),
];

/// Selector-to-relative-path table for single-file assets.
pub fn known_selectors() -> &'static [(&'static str, &'static str)] {
    ASSET_MAP
}

/// What a download request resolved to: a concrete file, or a lazily
/// composed archive over the asset tree.
#[derive(Debug)]
pub enum AssetSource {
    File(PathBuf),
    Archive(Vec<ZipEntry>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Buffered,
    Streamed,
}

/// Streamed transfer for anything big enough that buffering would hurt,
/// buffered otherwise (streaming has per-request overhead unsuitable for
/// small files). Clients can force streaming for testing.
pub fn choose_transfer_mode(size_bytes: u64, force_stream: bool) -> TransferMode {
    if force_stream || size_bytes > STREAM_THRESHOLD_BYTES {
        TransferMode::Streamed
    } else {
        TransferMode::Buffered
    }
}

/// Content type sniffed from the file name, with the generic fallback the
/// asset bundles use.
pub fn content_type_for(file_name: &str) -> &'static str {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or("application/zip")
}

pub fn content_disposition(disposition: &str, file_name: &str) -> String {
    format!("{}; filename={}", disposition, file_name)
}

/// Resolves download requests against a task's asset storage.
pub struct AssetRetriever {
    config: Config,
}

impl AssetRetriever {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Maps a selector to a file or archive source. Unknown selectors,
    /// selectors the worker has not produced, and missing files all come
    /// back as the same `NotFound`.
    pub fn resolve_asset(&self, task: &Task, selector: &str) -> ApiResult<AssetSource> {
        let assets_root = self.config.assets_dir(&task.id);

        if selector == "all" {
            if task.available_assets.is_empty() {
                return Err(ApiError::NotFound);
            }
            let entries = collect_entries(&assets_root);
            if entries.is_empty() {
                return Err(ApiError::NotFound);
            }
            return Ok(AssetSource::Archive(entries));
        }

        let rel = ASSET_MAP
            .iter()
            .find(|(name, _)| *name == selector)
            .map(|(_, rel)| *rel)
            .ok_or(ApiError::NotFound)?;

        if !task.available_assets.contains(selector) {
            return Err(ApiError::NotFound);
        }

        let path = assets_root.join(rel);
        if !path.is_file() {
            return Err(ApiError::NotFound);
        }
        Ok(AssetSource::File(path))
    }

    /// Raw access to the asset tree for viewers that follow relative links
    /// (tiles, textured model resources). The path guard runs on every
    /// request; violations are indistinguishable from missing files, and
    /// directories are refused.
    pub fn resolve_raw_path(&self, task: &Task, unsafe_rel: &str) -> ApiResult<PathBuf> {
        let assets_root = self.config.assets_dir(&task.id);
        let path = security::resolve(&assets_root, Path::new(unsafe_rel))
            .map_err(|_| ApiError::NotFound)?;
        if !path.is_file() {
            return Err(ApiError::NotFound);
        }
        Ok(path)
    }

    /// Default attachment name: task name (or id) plus the selector.
    pub fn download_filename(&self, task: &Task, selector: &str) -> String {
        let base = task
            .name
            .clone()
            .unwrap_or_else(|| task.id.to_string())
            .replace(['/', '\\', ' '], "_");
        match selector {
            "all" => format!("{}-all.zip", base),
            _ => format!("{}-{}", base, selector),
        }
    }
}

fn collect_entries(root: &Path) -> Vec<ZipEntry> {
    let mut entries = Vec::new();
    for item in WalkDir::new(root).into_iter().flatten() {
        if !item.file_type().is_file() {
            continue;
        }
        let Ok(rel) = item.path().strip_prefix(root) else {
            continue;
        };
        entries.push(ZipEntry {
            name: rel.to_string_lossy().replace('\\', "/"),
            path: item.path().to_path_buf(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Builds the HTTP response for a single-file download, picking the
/// transfer mode by size. Buffered responses carry Content-Length; streamed
/// ones are chunked with a fixed-size read buffer.
pub async fn file_response(
    path: &Path,
    disposition: &str,
    download_name: Option<String>,
    force_stream: bool,
) -> ApiResult<Response> {
    let meta = tokio::fs::metadata(path).await.map_err(|_| ApiError::NotFound)?;
    if !meta.is_file() {
        return Err(ApiError::NotFound);
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or(ApiError::NotFound)?;
    let download_name = download_name.unwrap_or_else(|| file_name.clone());
    let content_type = content_type_for(&file_name);

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(disposition, &download_name),
        );

    let response = match choose_transfer_mode(meta.len(), force_stream) {
        TransferMode::Buffered => {
            let bytes = tokio::fs::read(path).await?;
            builder
                .header(header::CONTENT_LENGTH, meta.len())
                .body(Body::from(bytes))
        }
        TransferMode::Streamed => {
            let file = tokio::fs::File::open(path).await.map_err(|_| ApiError::NotFound)?;
            let stream = ReaderStream::with_capacity(file, STREAM_BUF_SIZE);
            builder.body(Body::from_stream(stream))
        }
    };

    response.map_err(|e| ApiError::Internal(e.to_string()))
}

/// Response for a composed archive download. Always streamed: the full
/// size is unknown until the last entry has been read.
pub fn archive_response(entries: Vec<ZipEntry>, download_name: String) -> ApiResult<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition("attachment", &download_name),
        )
        .body(Body::from_stream(zipstream::stream(entries)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}
