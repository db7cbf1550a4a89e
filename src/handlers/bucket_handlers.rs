//! Host-side handlers: projects, bucket CRUD, gallery, archive download and
//! moderation. Every route requires the owner identity header.

use crate::{
    errors::AppError,
    handlers::owner::OwnerId,
    models::{bucket::Bucket, project::Project},
    services::{
        archive_service::{ARCHIVE_CONTENT_TYPE, ExportMode},
        bucket_service::{BucketPatch, NewBucket},
        gallery_service::Gallery,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateProjectReq {
    pub name: String,
}

/// Query string of `GET /buckets/{bucket_id}/archive`.
#[derive(Debug, Deserialize)]
pub struct ArchiveQuery {
    pub mode: Option<String>,
    pub session_id: Option<Uuid>,
    /// Comma-separated upload ids for `mode=selected`.
    pub upload_ids: Option<String>,
}

impl ArchiveQuery {
    fn into_mode(self) -> Result<ExportMode, AppError> {
        match self.mode.as_deref().unwrap_or("all") {
            "all" => Ok(ExportMode::All),
            "guest" => self
                .session_id
                .map(|session_id| ExportMode::Guest { session_id })
                .ok_or_else(|| AppError::bad_request("mode=guest requires session_id")),
            "selected" => {
                let raw = self.upload_ids.unwrap_or_default();
                let upload_ids = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(Uuid::parse_str)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| AppError::bad_request("upload_ids must be comma-separated UUIDs"))?;
                Ok(ExportMode::Selected { upload_ids })
            }
            other => Err(AppError::bad_request(format!(
                "unknown export mode `{}`",
                other
            ))),
        }
    }
}

/// POST `/projects`
pub async fn create_project(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Json(req): Json<CreateProjectReq>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    let project = state.buckets.register_project(owner_id, &req.name).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// POST `/projects/{project_id}/buckets`
pub async fn create_bucket(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(project_id): Path<Uuid>,
    Json(req): Json<NewBucket>,
) -> Result<(StatusCode, Json<Bucket>), AppError> {
    let bucket = state
        .buckets
        .create_bucket(owner_id, project_id, req)
        .await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// GET `/projects/{project_id}/buckets`
pub async fn list_buckets(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(state.buckets.list_buckets(owner_id, project_id).await?))
}

/// GET `/buckets/{bucket_id}`
pub async fn get_bucket(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(state.buckets.get_bucket(owner_id, bucket_id).await?))
}

/// PATCH `/buckets/{bucket_id}`
pub async fn update_bucket(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
    Json(patch): Json<BucketPatch>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(
        state
            .buckets
            .update_policy(owner_id, bucket_id, patch)
            .await?,
    ))
}

/// POST `/buckets/{bucket_id}/deactivate`
pub async fn deactivate_bucket(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(state.buckets.deactivate(owner_id, bucket_id).await?))
}

/// DELETE `/buckets/{bucket_id}`
pub async fn delete_bucket(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.buckets.delete_bucket(owner_id, bucket_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/buckets/{bucket_id}/gallery`
pub async fn gallery(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
) -> Result<Json<Gallery>, AppError> {
    state.buckets.get_bucket(owner_id, bucket_id).await?;
    Ok(Json(state.gallery.build_gallery(bucket_id).await?))
}

/// GET `/buckets/{bucket_id}/archive?mode=all|guest|selected`
///
/// Streams a ZIP; the body starts flowing before every photo is fetched.
pub async fn download_archive(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(bucket_id): Path<Uuid>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, AppError> {
    let mode = query.into_mode()?;
    state.buckets.get_bucket(owner_id, bucket_id).await?;
    let export = state.archives.export_archive(bucket_id, mode).await?;

    let mut response = Response::new(Body::from_stream(export.stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ARCHIVE_CONTENT_TYPE),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition(&export.filename),
    );
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// DELETE `/uploads/{upload_id}`
pub async fn delete_upload(
    State(state): State<AppState>,
    OwnerId(owner_id): OwnerId,
    Path(upload_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.uploads.delete_upload(owner_id, upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `attachment; filename="..."` restricted to printable ASCII.
fn content_disposition(filename: &str) -> HeaderValue {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", ascii))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"photos.zip\""))
}
