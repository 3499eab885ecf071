//! OAuth2 error taxonomy and its HTTP renderings.

use crate::error::{DelegateError, RandomError};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use utoipa::ToSchema;

/// The standard OAuth2 error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OAuthErrorKind {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    ServerError,
}

impl OAuthErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorKind::InvalidRequest => "invalid_request",
            OAuthErrorKind::InvalidClient => "invalid_client",
            OAuthErrorKind::InvalidGrant => "invalid_grant",
            OAuthErrorKind::UnauthorizedClient => "unauthorized_client",
            OAuthErrorKind::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorKind::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorKind::InvalidScope => "invalid_scope",
            OAuthErrorKind::AccessDenied => "access_denied",
            OAuthErrorKind::ServerError => "server_error",
        }
    }

    fn default_status(&self) -> StatusCode {
        match self {
            OAuthErrorKind::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for OAuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body of the token and revocation endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub description: Option<String>,
    pub status: StatusCode,
}

impl OAuthError {
    pub fn new(kind: OAuthErrorKind) -> Self {
        Self {
            kind,
            description: None,
            status: kind.default_status(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorKind::InvalidRequest).with_description(description)
    }

    /// Failed client authentication, answered with `401` and a Basic challenge.
    pub fn invalid_client() -> Self {
        Self {
            kind: OAuthErrorKind::InvalidClient,
            description: Some("Client authentication failed".into()),
            status: StatusCode::UNAUTHORIZED,
        }
    }

    /// Carries no description. Code, PKCE and refresh failures look the same
    /// to the caller.
    pub fn invalid_grant() -> Self {
        Self::new(OAuthErrorKind::InvalidGrant)
    }

    pub fn server_error() -> Self {
        Self::new(OAuthErrorKind::ServerError)
    }

    /// Replace the default `400` with the configured status. Other statuses
    /// are left alone.
    pub fn with_policy_status(mut self, status: StatusCode) -> Self {
        if self.status == StatusCode::BAD_REQUEST {
            self.status = status;
        }
        self
    }

    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.kind.as_str().to_string(),
            error_description: self.description.clone(),
        }
    }
}

impl From<RandomError> for OAuthError {
    fn from(e: RandomError) -> Self {
        tracing::error!("Token generation failed: {}", e);
        OAuthError::server_error()
    }
}

impl From<DelegateError> for OAuthError {
    fn from(e: DelegateError) -> Self {
        tracing::error!("Password delegate failed: {}", e);
        OAuthError::server_error()
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let challenge = self.status == StatusCode::UNAUTHORIZED;
        let mut response = (self.status, Json(self.body())).into_response();
        if challenge {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"oauth\""),
            );
        }
        response
    }
}

/// Where an authorize response is delivered once the redirect URI is trusted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseMode {
    Query,
    Fragment,
}

/// An error of the authorization endpoint.
///
/// Errors found before the redirect URI is validated are rendered locally.
/// Everything after that goes back to the client through the redirect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizeError {
    Local(OAuthError),
    Redirect {
        error: OAuthError,
        redirect_uri: String,
        state: Option<String>,
        mode: ResponseMode,
    },
}

impl AuthorizeError {
    pub fn kind(&self) -> OAuthErrorKind {
        match self {
            AuthorizeError::Local(e) => e.kind,
            AuthorizeError::Redirect { error, .. } => error.kind,
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, AuthorizeError::Redirect { .. })
    }
}

impl IntoResponse for AuthorizeError {
    fn into_response(self) -> Response {
        match self {
            AuthorizeError::Local(error) => error_page(&error),
            AuthorizeError::Redirect {
                error,
                redirect_uri,
                state,
                mode,
            } => {
                let mut params = vec![("error", error.kind.as_str().to_string())];
                if let Some(desc) = error.description.clone() {
                    params.push(("error_description", desc));
                }
                if let Some(s) = state {
                    params.push(("state", s));
                }
                match build_redirect(&redirect_uri, mode, &params) {
                    Some(location) => found(&location),
                    None => error_page(&error),
                }
            }
        }
    }
}

/// Append parameters to the query or fragment of a redirect URI.
pub fn build_redirect(
    redirect_uri: &str,
    mode: ResponseMode,
    params: &[(&str, String)],
) -> Option<String> {
    let mut url = url::Url::parse(redirect_uri).ok()?;
    match mode {
        ResponseMode::Query => {
            {
                let mut pairs = url.query_pairs_mut();
                for (key, value) in params {
                    pairs.append_pair(key, value);
                }
            }
            Some(url.to_string())
        }
        ResponseMode::Fragment => {
            let mut encoded = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in params {
                encoded.append_pair(key, value);
            }
            url.set_fragment(Some(&encoded.finish()));
            Some(url.to_string())
        }
    }
}

/// `302 Found` to `location`.
pub fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn error_page(error: &OAuthError) -> Response {
    let description = error
        .description
        .as_deref()
        .unwrap_or("The authorization request could not be processed.");
    let html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Authorization error</title>
</head>
<body>
    <main>
        <h1>Authorization error</h1>
        <p><code>{}</code></p>
        <p>{}</p>
    </main>
</body>
</html>"#,
        error.kind.as_str(),
        html_escape(description)
    );
    (error.status, Html(html)).into_response()
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
