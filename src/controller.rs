use crate::config::{validate_project_id, Config};
use crate::error::{ApiError, ApiResult};
use crate::tasks::{scan_images, PendingAction, SharedStore, Task, TaskStatus};
use crate::uploads::{ChunkParams, UploadIngestor};
use crate::worker::WorkerQueue;
use bytes::Bytes;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// One uploaded file, already drained from the transport layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Bytes,
}

/// Field edits that may accompany create/upload/update requests.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub options: Option<serde_json::Value>,
    pub resize_to: Option<i32>,
    pub public: Option<bool>,
    pub project: Option<String>,
}

impl TaskPatch {
    pub fn is_mutation(&self) -> bool {
        self.name.is_some()
            || self.options.is_some()
            || self.resize_to.is_some()
            || self.public.is_some()
            || self.project.is_some()
    }

    fn apply(&self, task: &mut Task) -> ApiResult<()> {
        if let Some(project) = &self.project {
            if !validate_project_id(project) {
                return Err(ApiError::Validation("invalid project id".to_string()));
            }
            task.project_id = project.clone();
        }
        if let Some(name) = &self.name {
            task.name = Some(name.clone());
        }
        if let Some(options) = &self.options {
            task.options = options.clone();
        }
        if let Some(resize_to) = self.resize_to {
            task.resize_to = Some(resize_to);
        }
        if let Some(public) = self.public {
            task.public = public;
        }
        Ok(())
    }
}

/// Whether a field edit warrants handing the task back to the worker.
///
/// Any mutation currently qualifies, mirroring the permissive historical
/// behavior; diffing individual fields to re-enqueue less often is a known
/// candidate for tightening.
pub fn needs_reprocessing(diff: &TaskPatch) -> bool {
    diff.is_mutation()
}

pub struct CreateRequest {
    pub partial: bool,
    pub files: Vec<UploadedFile>,
    pub patch: TaskPatch,
}

pub struct ImportRequest {
    pub name: Option<String>,
    pub url: Option<String>,
    pub files: Vec<UploadedFile>,
    pub chunk: Option<ChunkParams>,
}

/// Result of an import call: either an intermediate chunk was stored, or
/// the task now exists and is queued.
#[derive(Debug)]
pub enum ImportOutcome {
    ChunkReceived,
    Created(Task),
}

/// Orchestrates the task lifecycle: mutates the store, drives the
/// ingestor, and hands ids to the worker queue. Enqueue failures are
/// logged and never roll back the persisted transition.
pub struct TaskController {
    config: Config,
    store: SharedStore,
    ingestor: Arc<UploadIngestor>,
    queue: Arc<WorkerQueue>,
    http: reqwest::Client,
}

impl TaskController {
    pub fn new(
        config: Config,
        store: SharedStore,
        ingestor: Arc<UploadIngestor>,
        queue: Arc<WorkerQueue>,
    ) -> Self {
        Self {
            config,
            store,
            ingestor,
            queue,
            http: reqwest::Client::new(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    fn enqueue(&self, id: Uuid) {
        if let Err(e) = self.queue.enqueue(id) {
            warn!("task {} transition persisted but not enqueued: {}", id, e);
        }
    }

    fn get_scoped(&self, project_id: &str, id: &Uuid) -> ApiResult<Task> {
        self.store
            .get_scoped(project_id, id)
            .ok_or(ApiError::NotFound)
    }

    /// Creates a task. A partial create is a placeholder that accepts
    /// uploads later and is not enqueued; a full create requires at least
    /// two images and is all-or-nothing: on any failure neither the record
    /// nor any file persists.
    pub async fn create(&self, project_id: &str, req: CreateRequest) -> ApiResult<Task> {
        let mut task = Task::new(project_id);
        req.patch.apply(&mut task)?;
        if task.resize_to.is_some() {
            task.pending_action = PendingAction::Resize;
        }

        if req.partial {
            task.partial = true;
            self.ingestor.create_task_directories(&task.id)?;
            let id = self.store.insert(task.clone());
            info!("created partial task {} in project {}", id, project_id);
            return Ok(task);
        }

        if req.files.len() < 2 {
            return Err(ApiError::Validation(
                "Cannot create task, you need at least 2 images".to_string(),
            ));
        }

        self.ingestor.create_task_directories(&task.id)?;
        if let Err(e) = self.ingest_images(&task.id, &req.files).await {
            let _ = self.ingestor.remove_task_directories(&task.id);
            return Err(e);
        }

        let (count, bytes) = scan_images(&self.config, &task.id);
        task.images_count = count;
        task.size_bytes = bytes;
        task.partial = false;

        let id = self.store.insert(task.clone());
        self.enqueue(id);
        info!(
            "created task {} in project {} ({} images, {} bytes)",
            id, project_id, count, bytes
        );
        Ok(task)
    }

    /// Commits a partial task once its uploads are done. Requires at least
    /// one ingested image; a failed commit leaves the task untouched.
    pub fn commit(&self, project_id: &str, id: &Uuid) -> ApiResult<Task> {
        self.get_scoped(project_id, id)?;

        let (count, bytes) = scan_images(&self.config, id);
        if count < 1 {
            return Err(ApiError::Validation(
                "You need to upload at least 1 file before commit".to_string(),
            ));
        }

        let task = self
            .store
            .update(id, |t| {
                t.partial = false;
                t.images_count = count;
                t.size_bytes = bytes;
                t.clone()
            })
            .ok_or(ApiError::NotFound)?;
        self.enqueue(*id);
        Ok(task)
    }

    /// Adds images to an existing task and applies accompanying field
    /// edits. Does not enqueue by itself; commit (or update) does that.
    pub async fn upload(
        &self,
        project_id: &str,
        id: &Uuid,
        files: Vec<UploadedFile>,
        patch: TaskPatch,
    ) -> ApiResult<Task> {
        self.get_scoped(project_id, id)?;
        if files.is_empty() {
            return Err(ApiError::Validation("No files uploaded".to_string()));
        }

        self.ingest_images(id, &files).await?;
        let (count, bytes) = scan_images(&self.config, id);
        let task = self
            .store
            .update(id, |t| {
                t.images_count = count;
                t.size_bytes = bytes;
                patch.apply(t).map(|_| t.clone())
            })
            .ok_or(ApiError::NotFound)??;
        Ok(task)
    }

    /// Shared transition for cancel/restart/remove: persist the action,
    /// clear the previous error, then fire-and-forget to the worker.
    pub fn set_pending_action(
        &self,
        project_id: &str,
        id: &Uuid,
        action: PendingAction,
    ) -> ApiResult<()> {
        self.get_scoped(project_id, id)?;
        self.store
            .update(id, |t| t.set_pending_action(action))
            .ok_or(ApiError::NotFound)?;
        self.enqueue(*id);
        Ok(())
    }

    /// Independent copy of a task's metadata and on-disk assets. The copy
    /// is not enqueued; it is a no-op until committed or restarted.
    pub fn duplicate(&self, project_id: &str, id: &Uuid) -> ApiResult<Task> {
        let task = self.get_scoped(project_id, id)?;
        let copy = task.duplicate_record();

        self.ingestor.create_task_directories(&copy.id)?;
        if let Err(e) = copy_tree(&self.config.task_dir(id), &self.config.task_dir(&copy.id)) {
            let _ = self.ingestor.remove_task_directories(&copy.id);
            return Err(ApiError::Internal(e.to_string()));
        }

        self.store.insert(copy.clone());
        info!("duplicated task {} as {}", id, copy.id);
        Ok(copy)
    }

    /// Imports a previously exported assets archive, either from a single
    /// uploaded file (possibly arriving through the chunked path) or from
    /// a remote URL. Exactly one of the two sources must be supplied.
    pub async fn import(&self, project_id: &str, req: ImportRequest) -> ApiResult<ImportOutcome> {
        if req.chunk.is_some() && req.files.len() > 1 {
            return Err(ApiError::InvalidParameter(
                "chunked uploads carry exactly one file".to_string(),
            ));
        }
        if req.url.is_none() && req.files.len() != 1 {
            return Err(ApiError::Validation(
                "Cannot create task, you need to upload 1 file".to_string(),
            ));
        }
        if req.url.is_some() && !req.files.is_empty() {
            return Err(ApiError::Validation(
                "Cannot create task, either specify a URL or upload 1 file".to_string(),
            ));
        }

        // Accumulate chunks into the session file until the last one lands.
        if let Some(chunk) = &req.chunk {
            let data = &req.files[0].data;
            let complete = self.ingestor.write_chunk(chunk, data).await?;
            if !complete {
                return Ok(ImportOutcome::ChunkReceived);
            }
        }

        let mut task = Task::new(project_id);
        task.name = Some(req.name.unwrap_or_else(|| "Imported Task".to_string()));
        task.import_url = Some(
            req.url
                .clone()
                .unwrap_or_else(|| "file://all.zip".to_string()),
        );
        task.status = TaskStatus::Running;
        task.pending_action = PendingAction::Import;

        self.ingestor.create_task_directories(&task.id)?;
        let dest = self.config.assets_dir(&task.id).join("all.zip");

        let ingested = match (&req.chunk, &req.url) {
            (Some(chunk), _) => {
                self.ingestor
                    .finalize_chunked_upload(&chunk.session_id, &dest)
                    .await
            }
            (None, Some(url)) => self.fetch_to(url, &dest).await,
            (None, None) => self.ingestor.ingest_whole_file(&req.files[0].data, &dest).await,
        };
        if let Err(e) = ingested {
            let _ = self.ingestor.remove_task_directories(&task.id);
            return Err(e);
        }

        let id = self.store.insert(task.clone());
        self.enqueue(id);
        info!("import task {} created in project {}", id, project_id);
        Ok(ImportOutcome::Created(task))
    }

    /// General field edit. Mutations re-enqueue so the worker can
    /// re-evaluate the task.
    pub fn update(&self, project_id: &str, id: &Uuid, patch: TaskPatch) -> ApiResult<Task> {
        self.get_scoped(project_id, id)?;
        let reprocess = needs_reprocessing(&patch);
        let task = self
            .store
            .update(id, |t| patch.apply(t).map(|_| t.clone()))
            .ok_or(ApiError::NotFound)??;
        if reprocess {
            self.enqueue(*id);
        }
        Ok(task)
    }

    async fn ingest_images(&self, id: &Uuid, files: &[UploadedFile]) -> ApiResult<()> {
        let images_dir = self.config.images_dir(id);
        for file in files {
            // Client-supplied names are flattened to their basename before
            // they touch the task's storage root.
            let name = Path::new(&file.file_name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| n != "." && n != "..")
                .unwrap_or_else(|| "upload.bin".to_string());
            self.ingestor
                .ingest_whole_file(&file.data, &images_dir.join(name))
                .await?;
        }
        Ok(())
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> ApiResult<()> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ApiError::Validation(format!("cannot fetch import URL: {}", e)))?;
        self.ingestor
            .ingest_stream(response.bytes_stream(), dest)
            .await
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
