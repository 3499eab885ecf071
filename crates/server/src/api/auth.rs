//! Authentication extractor for API handlers.
//!
//! Runs the request authenticator chain (session cookie, HTTP Basic, bearer
//! token) and rejects anonymous requests.

use crate::AppResources;
use crate::authenticator::Principal;
use crate::oauth2::error::{OAuthError, OAuthErrorKind};
use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Error body for rejected API requests.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AuthError {
    /// Error code (`invalid_token` or `server_error`)
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl AuthError {
    pub fn unauthenticated() -> Self {
        Self {
            error: "invalid_token".to_string(),
            error_description: Some("Authentication required".to_string()),
        }
    }

    pub fn server_error() -> Self {
        Self {
            error: OAuthErrorKind::ServerError.as_str().to_string(),
            error_description: None,
        }
    }
}

impl From<OAuthError> for AuthError {
    fn from(err: OAuthError) -> Self {
        let body = err.body();
        Self {
            error: body.error,
            error_description: body.error_description,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if self.error == "invalid_token" {
            let mut response = (StatusCode::UNAUTHORIZED, Json(self)).into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"api\""),
            );
            return response;
        }
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

/// Axum extractor yielding the authenticated [`Principal`].
///
/// # Example
///
/// ```ignore
/// async fn handler(Authenticated(user): Authenticated) -> impl IntoResponse {
///     format!("Hello, {}", user.name)
/// }
/// ```
pub struct Authenticated(pub Principal);

impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts
            .extensions
            .get::<AppResources>()
            .cloned()
            .ok_or_else(|| {
                tracing::error!("AppResources not found in extensions");
                AuthError::server_error()
            })?;

        match resources
            .authenticator
            .authenticate_request(&parts.headers)
            .await
        {
            Ok(Some(principal)) => Ok(Authenticated(principal)),
            Ok(None) => Err(AuthError::unauthenticated()),
            Err(e) => {
                tracing::error!("Request authentication failed: {}", e);
                Err(OAuthError::server_error().into())
            }
        }
    }
}
