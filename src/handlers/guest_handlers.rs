//! Guest-facing handlers: landing page data, session open/resume, photo
//! uploads, and serving stored photos.

use crate::{
    errors::AppError,
    models::scan_event::ScanSignal,
    services::{
        ServiceError,
        naming,
        object_store::ObjectStoreError,
        session_service::{GuestIdentity, SessionHandle},
        upload_service::{IncomingFile, IngestReport},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct LandingQuery {
    /// Where the link was opened from (`qr`, `link`, ...).
    pub src: Option<String>,
}

/// Public view of a bucket shown to guests before they identify themselves.
#[derive(Debug, Serialize)]
pub struct GuestLanding {
    pub bucket_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub max_images_per_guest: i64,
    pub max_file_size_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionReq {
    pub guest_name: String,
    pub guest_contact: String,
}

fn header_string(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// GET `/u/{access_token}`
///
/// Records a scan for every resolvable token, then requires the bucket to be
/// usable.
pub async fn landing(
    State(state): State<AppState>,
    Path(access_token): Path<String>,
    Query(query): Query<LandingQuery>,
    headers: HeaderMap,
) -> Result<Json<GuestLanding>, AppError> {
    let bucket = state.buckets.resolve_by_token(&access_token).await?;

    state.scans.spawn_record(
        bucket.id,
        ScanSignal {
            user_agent: header_string(&headers, header::USER_AGENT),
            referrer: header_string(&headers, header::REFERER),
            source: query.src,
        },
    );

    if let Some(reason) = bucket.unavailable_reason(Utc::now()) {
        return Err(AppError::from(ServiceError::BucketUnavailable(reason)));
    }
    Ok(Json(GuestLanding {
        bucket_id: bucket.id,
        name: bucket.name,
        description: bucket.description,
        max_images_per_guest: bucket.max_images_per_guest,
        max_file_size_bytes: bucket.max_file_size_bytes,
        expires_at: bucket.expires_at,
    }))
}

/// POST `/u/{access_token}/sessions`
pub async fn open_session(
    State(state): State<AppState>,
    Path(access_token): Path<String>,
    Json(req): Json<OpenSessionReq>,
) -> Result<Json<SessionHandle>, AppError> {
    let bucket = state.buckets.resolve_upload_entry(&access_token).await?;
    let handle = state
        .sessions
        .open(&bucket, GuestIdentity::new(req.guest_name, req.guest_contact))
        .await?;
    Ok(Json(handle))
}

/// POST `/sessions/{session_token}/uploads` (multipart, one part per photo)
pub async fn upload_photos(
    State(state): State<AppState>,
    Path(session_token): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<IngestReport>, AppError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        tracing::warn!(error = %err, "failed to read multipart field");
        AppError::bad_request(format!("invalid multipart data: {}", err))
    })? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            tracing::debug!("skipping multipart field without filename");
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await.map_err(|err| {
            AppError::bad_request(format!("failed to read `{}`: {}", filename, err))
        })?;
        files.push(IncomingFile {
            filename,
            content_type,
            bytes,
        });
    }

    if files.is_empty() {
        return Err(AppError::bad_request("no files in request"));
    }

    let report = state.uploads.ingest_uploads(&session_token, files).await?;
    Ok(Json(report))
}

/// GET `/objects/{*path}`: serves payloads behind the URLs handed out at
/// upload time.
pub async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let data = match state.objects.get(&path).await {
        Ok(data) => data,
        Err(ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidPath(_)) => {
            return Err(AppError::from(ServiceError::NotFound("object")));
        }
        Err(err) => return Err(AppError::from(ServiceError::Storage(err))),
    };

    let content_type =
        naming::image_content_type_for(&path).unwrap_or("application/octet-stream");
    let length = data.len();
    let mut response = Response::new(Body::from(data));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600"),
    );
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
