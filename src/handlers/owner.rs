//! Owner identity extractor.
//!
//! Authentication happens upstream; the auth layer forwards the verified
//! account id in `x-owner-id` and this service trusts it.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

pub const OWNER_HEADER: &str = "x-owner-id";

/// The authenticated host account making the request.
#[derive(Debug, Clone, Copy)]
pub struct OwnerId(pub Uuid);

impl<S> FromRequestParts<S> for OwnerId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::unauthorized("missing owner identity"))?;
        Uuid::parse_str(raw.trim())
            .map(OwnerId)
            .map_err(|_| AppError::unauthorized("malformed owner identity"))
    }
}
