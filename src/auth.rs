//! Authenticated owner extraction
//!
//! Token verification happens upstream (reverse proxy or identity gateway); by the
//! time a request reaches this server the verified account id is carried in the
//! `X-Auth-User` header. Requests without it are rejected before any storage access.

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;

/// Header carrying the verified account id
pub const AUTH_USER_HEADER: &str = "x-auth-user";

/// The owner id of the authenticated caller
#[derive(Debug, Clone)]
pub struct AuthedOwner(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthedOwner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(AUTH_USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Auth("missing caller identity".to_string()))?;

        Ok(AuthedOwner(owner.to_string()))
    }
}
