use crate::{
    error::{AppError, CreateError},
    filename,
    models::{CancelResponse, DownloadRequest, DownloadResponse, FormatRequest},
    AppState,
};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use walkdir::WalkDir;

fn rejected(err: CreateError) -> AppError {
    match err {
        CreateError::PoolClosed => AppError::Internal(err.into()),
        _ => AppError::BadRequest(err.to_string()),
    }
}

// ===================================================================
//                          CONFIG HANDLER
// ===================================================================

/// # GET /config - Returns the configuration the server started with.
pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.config.as_ref().clone()))
}

// ===================================================================
//                          FORMATS HANDLER
// ===================================================================

/// # GET /formats - Summarizes the qualities available for a URL.
pub async fn list_formats(
    State(state): State<AppState>,
    Query(params): Query<FormatRequest>,
) -> Result<impl IntoResponse, AppError> {
    if params.url.trim().is_empty() {
        return Err(AppError::BadRequest("URL parameter cannot be empty".to_string()));
    }
    tracing::info!("Fetching formats for URL: {}", params.url);

    let analysis = state
        .orchestrator
        .analyze(&params.url)
        .await
        .map_err(|e| AppError::Engine(e.to_string()))?;
    tracing::info!(
        "Found {} quality options for '{}' via {}",
        analysis.qualities.len(),
        analysis.title,
        analysis.strategy
    );
    Ok((StatusCode::OK, Json(analysis)))
}

// ===================================================================
//                          DOWNLOAD HANDLERS
// ===================================================================

/// # POST /downloads - Queues a download task.
pub async fn create_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let task_id = state
        .orchestrator
        .create(&payload.url, payload.options)
        .map_err(rejected)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse {
            message: "Download queued".to_string(),
            task_id,
        }),
    ))
}

/// # GET /downloads - Lists every known task, oldest first.
pub async fn list_downloads(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.list()))
}

/// # GET /downloads/:id - Returns one task.
pub async fn get_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let task = state
        .orchestrator
        .get(&task_id)
        .ok_or_else(|| AppError::NotFound(format!("Task '{}' not found.", task_id)))?;
    Ok((StatusCode::OK, Json(task)))
}

/// # POST /downloads/:id/cancel - Cancels a task that has not finished.
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if state.orchestrator.get(&task_id).is_none() {
        return Err(AppError::NotFound(format!("Task '{}' not found.", task_id)));
    }
    let cancelled = state.orchestrator.cancel(&task_id);
    Ok((StatusCode::OK, Json(CancelResponse { task_id, cancelled })))
}

// ===================================================================
//                          FILE HANDLERS
// ===================================================================

/// # GET /files - Lists all downloaded files.
pub async fn list_files(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(finished_files(&download_dir(&state))))
}

/// Relative paths of finished files, skipping in-flight working files.
fn finished_files(download_dir: &std::path::Path) -> Vec<String> {
    let mut files = Vec::new();
    if !download_dir.exists() {
        return files;
    }

    for entry in WalkDir::new(download_dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() || filename::is_working_file(&entry.file_name().to_string_lossy()) {
            continue;
        }
        if let Ok(relative_path) = entry.path().strip_prefix(download_dir) {
            files.push(relative_path.to_string_lossy().to_string());
        }
    }
    files.sort();
    files
}

/// # GET /files/*path - Streams a single downloaded file.
pub async fn get_file(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let decoded_path = percent_decode_str(&path).decode_utf8_lossy().to_string();
    let download_dir = download_dir(&state);
    let file_path = download_dir.join(&decoded_path);

    let canonical_base = tokio::fs::canonicalize(&download_dir).await?;
    let canonical_file = tokio::fs::canonicalize(&file_path)
        .await
        .map_err(|_| AppError::NotFound(format!("File '{}' not found.", decoded_path)))?;

    if !canonical_file.starts_with(canonical_base) || !canonical_file.is_file() {
        return Err(AppError::NotFound(format!("File '{}' not found.", decoded_path)));
    }

    let file = tokio::fs::File::open(&canonical_file).await?;
    let stream = tokio_util::io::ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let file_name = canonical_file
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .replace('"', "'");
    let mut headers = HeaderMap::new();
    let disposition = format!("attachment; filename=\"{}\"", file_name);
    // Non-ASCII names are not valid header values; fall back to a bare attachment.
    let value = HeaderValue::from_str(&disposition).unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    headers.insert(header::CONTENT_DISPOSITION, value);

    Ok((headers, body))
}

// ===================================================================
//                          CLEANUP HANDLER
// ===================================================================

/// # POST /cleanup - Runs one retention sweep now.
pub async fn run_cleanup(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let report = state.cleanup.run_once().await?;
    Ok((StatusCode::OK, Json(report)))
}

fn download_dir(state: &AppState) -> PathBuf {
    state.orchestrator.output_dir().to_path_buf()
}
