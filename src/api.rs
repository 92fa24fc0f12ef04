use crate::assets::{archive_response, file_response, AssetRetriever, AssetSource};
use crate::config::validate_project_id;
use crate::controller::{
    CreateRequest, ImportOutcome, ImportRequest, TaskController, TaskPatch, UploadedFile,
};
use crate::error::{ApiError, ApiResult};
use crate::tasks::PendingAction;
use crate::uploads::parse_chunk_params;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<TaskController>,
    pub retriever: Arc<AssetRetriever>,
}

/// API Routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/projects/:project/tasks", post(create_task).get(list_tasks))
        .route("/projects/:project/tasks/import", post(import_task))
        .route(
            "/projects/:project/tasks/:id",
            get(retrieve_task).patch(update_task),
        )
        .route("/projects/:project/tasks/:id/commit", post(commit_task))
        .route("/projects/:project/tasks/:id/upload", post(upload_images))
        .route("/projects/:project/tasks/:id/duplicate", post(duplicate_task))
        .route("/projects/:project/tasks/:id/cancel", post(cancel_task))
        .route("/projects/:project/tasks/:id/restart", post(restart_task))
        .route("/projects/:project/tasks/:id/remove", post(remove_task))
        .route("/projects/:project/tasks/:id/output", get(task_output))
        .route(
            "/projects/:project/tasks/:id/download/:asset",
            get(download_asset),
        )
        .route("/projects/:project/tasks/:id/assets/*path", get(raw_asset))
        .layer(axum::extract::DefaultBodyLimit::disable())
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "name": "orthotask",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Processing task ingestion and asset service"
    }))
}

fn check_project(project: &str) -> ApiResult<()> {
    if !validate_project_id(project) {
        return Err(ApiError::InvalidParameter(
            "invalid project id".to_string(),
        ));
    }
    Ok(())
}

/// Malformed task ids behave exactly like missing tasks.
fn parse_task_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound)
}

/// Everything a multipart request carried: uploaded files in arrival
/// order, plus the plain text fields.
#[derive(Default)]
struct MultipartPayload {
    files: Vec<UploadedFile>,
    fields: HashMap<String, String>,
}

async fn read_multipart(
    mut multipart: axum_extra::extract::Multipart,
) -> ApiResult<MultipartPayload> {
    let mut payload = MultipartPayload::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        if let Some(file_name) = field.file_name().map(|f| f.to_string()) {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::InvalidParameter(format!("bad multipart body: {}", e)))?;
            payload.files.push(UploadedFile { file_name, data });
        } else if let Ok(text) = field.text().await {
            payload.fields.insert(name, text);
        }
    }
    Ok(payload)
}

fn patch_from_fields(fields: &HashMap<String, String>) -> ApiResult<TaskPatch> {
    let options = fields
        .get("options")
        .map(|raw| {
            serde_json::from_str(raw)
                .map_err(|_| ApiError::InvalidParameter("options must be valid JSON".to_string()))
        })
        .transpose()?;
    let resize_to = fields
        .get("resize_to")
        .map(|raw| {
            raw.trim().parse::<i32>().map_err(|_| {
                ApiError::InvalidParameter("resize_to must be an integer".to_string())
            })
        })
        .transpose()?;

    Ok(TaskPatch {
        name: fields.get("name").cloned(),
        project: fields.get("project").cloned(),
        options,
        resize_to,
        public: fields
            .get("public")
            .map(|v| matches!(v.as_str(), "true" | "1")),
    })
}

fn field_is_true(fields: &HashMap<String, String>, key: &str) -> bool {
    matches!(fields.get(key).map(|s| s.as_str()), Some("true") | Some("1"))
}

async fn create_task(
    State(state): State<AppState>,
    Path(project): Path<String>,
    multipart: axum_extra::extract::Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    check_project(&project)?;
    let payload = read_multipart(multipart).await?;
    let patch = patch_from_fields(&payload.fields)?;

    let task = state
        .controller
        .create(
            &project,
            CreateRequest {
                partial: field_is_true(&payload.fields, "partial"),
                files: payload.files,
                patch,
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(serde_json::to_value(task)?)))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let tasks = state.controller.store().list(&project);
    Ok(Json(serde_json::to_value(tasks)?))
}

async fn retrieve_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let task = state
        .controller
        .store()
        .get_scoped(&project, &id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::to_value(task)?))
}

async fn update_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let task = state.controller.update(&project, &id, patch)?;
    Ok(Json(serde_json::to_value(task)?))
}

async fn commit_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let task = state.controller.commit(&project, &id)?;
    Ok(Json(serde_json::to_value(task)?))
}

async fn upload_images(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
    multipart: axum_extra::extract::Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let payload = read_multipart(multipart).await?;
    let patch = patch_from_fields(&payload.fields)?;
    let uploaded = payload.files.len();
    state.controller.upload(&project, &id, payload.files, patch).await?;
    Ok(Json(json!({ "success": true, "uploaded": uploaded })))
}

async fn duplicate_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    match state.controller.duplicate(&project, &id) {
        Ok(task) => Ok((
            StatusCode::OK,
            Json(json!({ "success": true, "task": serde_json::to_value(task)? })),
        )),
        // Storage trouble is reported in-band; the source task is intact.
        Err(ApiError::Internal(_)) => Ok((
            StatusCode::OK,
            Json(json!({ "error": "Cannot duplicate task" })),
        )),
        Err(e) => Err(e),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    set_pending_action(&state, &project, &id, PendingAction::Cancel)
}

async fn restart_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    set_pending_action(&state, &project, &id, PendingAction::Restart)
}

async fn remove_task(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    set_pending_action(&state, &project, &id, PendingAction::Remove)
}

fn set_pending_action(
    state: &AppState,
    project: &str,
    id: &str,
    action: PendingAction,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(project)?;
    let id = parse_task_id(id)?;
    state.controller.set_pending_action(project, &id, action)?;
    Ok(Json(json!({ "success": true })))
}

async fn task_output(
    State(state): State<AppState>,
    Path((project, id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<serde_json::Value>> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let line = params
        .get("line")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let task = state
        .controller
        .store()
        .get_scoped(&project, &id)
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::Value::String(task.output(line))))
}

async fn import_task(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    multipart: axum_extra::extract::Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    check_project(&project)?;
    let payload = read_multipart(multipart).await?;

    // Chunking parameters may arrive as form fields or query params.
    let lookup = |key: &str| {
        payload
            .fields
            .get(key)
            .or_else(|| query.get(key))
            .map(|s| s.as_str())
    };
    let chunk = if payload.files.is_empty() {
        None
    } else {
        parse_chunk_params(
            lookup("sessionId"),
            lookup("chunkIndex"),
            lookup("totalChunkCount"),
            lookup("byteOffset"),
        )?
    };

    let outcome = state
        .controller
        .import(
            &project,
            ImportRequest {
                name: payload.fields.get("name").cloned(),
                url: payload
                    .fields
                    .get("url")
                    .or_else(|| query.get("url"))
                    .filter(|u| !u.is_empty())
                    .cloned(),
                files: payload.files,
                chunk,
            },
        )
        .await?;

    match outcome {
        ImportOutcome::ChunkReceived => Ok((StatusCode::OK, Json(json!({ "uploaded": true })))),
        ImportOutcome::Created(task) => {
            Ok((StatusCode::CREATED, Json(serde_json::to_value(task)?)))
        }
    }
}

async fn download_asset(
    State(state): State<AppState>,
    Path((project, id, asset)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Response> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let task = state
        .controller
        .store()
        .get_scoped(&project, &id)
        .ok_or(ApiError::NotFound)?;

    let download_name = params
        .get("filename")
        .cloned()
        .unwrap_or_else(|| state.retriever.download_filename(&task, &asset));
    let force_stream = matches!(
        params.get("_force_stream").map(|s| s.as_str()),
        Some("1") | Some("true")
    );

    match state.retriever.resolve_asset(&task, &asset)? {
        AssetSource::File(path) => {
            file_response(&path, "attachment", Some(download_name), force_stream).await
        }
        AssetSource::Archive(entries) => archive_response(entries, download_name),
    }
}

async fn raw_asset(
    State(state): State<AppState>,
    Path((project, id, path)): Path<(String, String, String)>,
) -> ApiResult<Response> {
    check_project(&project)?;
    let id = parse_task_id(&id)?;
    let task = state
        .controller
        .store()
        .get_scoped(&project, &id)
        .ok_or(ApiError::NotFound)?;

    let resolved = state.retriever.resolve_raw_path(&task, &path)?;
    file_response(&resolved, "inline", None, false).await
}
