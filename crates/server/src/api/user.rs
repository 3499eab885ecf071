//! Identity of the caller.

use crate::api::auth::{AuthError, Authenticated};
use crate::authenticator::Principal;
use axum::Json;

pub const USER_TAG: &str = "User";

/// Returns the principal the request is authenticated as.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/api/user",
    tag = USER_TAG,
    operation_id = "Current User",
    summary = "Who am I",
    description = "Returns the principal behind the session cookie, HTTP Basic credentials or bearer token \
                   presented with the request.",
    responses(
        (status = 200, description = "Authenticated principal", body = Principal),
        (status = 401, description = "No valid credentials", body = AuthError),
    ),
    security(
        ("Authorization" = []),
        ("OAuth2" = [])
    )
)]
pub async fn current_user(Authenticated(principal): Authenticated) -> Json<Principal> {
    Json(principal)
}
