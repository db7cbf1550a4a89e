//! Defines routes for the host and guest surfaces.
//!
//! ## Structure
//! - **Host endpoints** (require `x-owner-id`)
//!   - `POST   /projects`: register a project
//!   - `POST   /projects/{project_id}/buckets`: create bucket
//!   - `GET    /projects/{project_id}/buckets`: list buckets
//!   - `GET|PATCH|DELETE /buckets/{bucket_id}`: read, update policy, delete
//!   - `POST   /buckets/{bucket_id}/deactivate`
//!   - `GET    /buckets/{bucket_id}/gallery`: per-guest grouped view
//!   - `GET    /buckets/{bucket_id}/archive`: streamed ZIP export
//!   - `DELETE /uploads/{upload_id}`: moderation
//!
//! - **Guest endpoints** (capability tokens in the path)
//!   - `GET    /u/{access_token}`: landing data, records a scan
//!   - `POST   /u/{access_token}/sessions`: open or resume a session
//!   - `POST   /sessions/{session_token}/uploads`: multipart upload batch
//!   - `GET    /objects/{*path}`: stored photo payloads

use crate::{
    handlers::{
        bucket_handlers::{
            create_bucket, create_project, deactivate_bucket, delete_bucket, delete_upload,
            download_archive, gallery, get_bucket, list_buckets, update_bucket,
        },
        guest_handlers::{get_object, landing, open_session, upload_photos},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

/// Build the router. `max_body_bytes` bounds a whole upload batch.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Host routes
        .route("/projects", post(create_project))
        .route(
            "/projects/{project_id}/buckets",
            post(create_bucket).get(list_buckets),
        )
        .route(
            "/buckets/{bucket_id}",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        .route("/buckets/{bucket_id}/deactivate", post(deactivate_bucket))
        .route("/buckets/{bucket_id}/gallery", get(gallery))
        .route("/buckets/{bucket_id}/archive", get(download_archive))
        .route("/uploads/{upload_id}", delete(delete_upload))
        // Guest routes
        .route("/u/{access_token}", get(landing))
        .route("/u/{access_token}/sessions", post(open_session))
        .route("/sessions/{session_token}/uploads", post(upload_photos))
        .route("/objects/{*path}", get(get_object))
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
