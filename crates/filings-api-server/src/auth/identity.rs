use crate::utils::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

/// The identity provider's user id for the current request. Upstream
/// authentication terminates before this service; what reaches us is the
/// resolved id in the `x-user-id` header.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-id header".to_string()))?;

        let user_id = value
            .parse::<i64>()
            .map_err(|_| ApiError::Unauthorized(format!("invalid x-user-id: {}", value)))?;

        Ok(CurrentUser(user_id))
    }
}
