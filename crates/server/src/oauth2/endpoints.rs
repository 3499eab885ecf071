//! OAuth2 HTTP endpoints.
//!
//! Implements the OAuth2 authorization server endpoints:
//! - Authorization endpoint
//! - Token endpoint
//! - Token revocation
//! - Server metadata document

use crate::AppResources;
use crate::authenticator::parse_basic_auth;
use crate::oauth2::OAUTH2_TAG;
use crate::oauth2::error::{ErrorResponse, OAuthError, found};
use crate::oauth2::grants::TokenRequest;
use crate::oauth2::server::{AuthorizeRequest, ServerMetadata, TokenResponse};
use axum::{
    Form, Json,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// Creates the OAuth2 router.
pub fn router(resources: AppResources) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(authorize_get, authorize_post))
        .routes(routes!(token))
        .routes(routes!(revoke))
        .routes(routes!(metadata))
        .with_state(resources)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevokeRequest {
    pub token: String,
    pub token_type_hint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// OAuth2 Authorization endpoint.
#[tracing::instrument(skip(resources, headers))]
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize",
    summary = "Start an authorization code or implicit flow",
    description = "Validates the client, its redirect URI and the response type. \
                   Unauthenticated users are sent to the login form and come back here afterwards.\n\n\
                   Errors found before the redirect URI is validated are shown on a local error page. \
                   Later errors are sent to the client's redirect URI.\n\n\
                   **PKCE:** pass `code_challenge` and `code_challenge_method` (`S256` or `plain`).",
    params(
        ("client_id" = String, Query, description = "The client identifier issued during client registration."),
        ("redirect_uri" = Option<String>, Query, description = "Must exactly match a registered redirect URI. May be omitted when the client has exactly one."),
        ("response_type" = String, Query, description = "`code` or `token`."),
        ("scope" = Option<String>, Query, description = "Space-separated list of requested scopes."),
        ("state" = Option<String>, Query, description = "Opaque value returned unchanged in the redirect."),
        ("code_challenge" = Option<String>, Query, description = "PKCE code challenge."),
        ("code_challenge_method" = Option<String>, Query, description = "PKCE challenge method, `S256` or `plain`."),
    ),
    responses(
        (status = 302, description = "Redirect to the client, or to the login form"),
        (status = 400, description = "Unknown client or unregistered redirect URI"),
    )
)]
pub async fn authorize_get(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Query(params): Query<AuthorizeRequest>,
) -> Response {
    handle_authorize(&resources, &headers, params).await
}

/// OAuth2 Authorization endpoint, form-encoded variant.
#[tracing::instrument(skip(resources, headers))]
#[utoipa::path(
    post,
    path = "/oauth/authorize",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Authorize (form)",
    summary = "Start an authorization flow with form parameters",
    description = "Same as `GET /oauth/authorize` with the parameters in a form body.",
    request_body(
        content = AuthorizeRequest,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 302, description = "Redirect to the client, or to the login form"),
        (status = 400, description = "Unknown client or unregistered redirect URI"),
    )
)]
pub async fn authorize_post(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Form(params): Form<AuthorizeRequest>,
) -> Response {
    handle_authorize(&resources, &headers, params).await
}

async fn handle_authorize(
    resources: &AppResources,
    headers: &HeaderMap,
    params: AuthorizeRequest,
) -> Response {
    let server = &resources.server;
    let validated = match server.validate_authorize(&params).await {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e.kind(), redirect = e.is_redirect(), "Authorize request rejected");
            return e.into_response();
        }
    };

    let principal = match resources
        .authorize_authenticator
        .authenticate_request(headers)
        .await
    {
        Ok(Some(principal)) => principal,
        Ok(None) => return found(&login_redirect(&params)),
        Err(e) => {
            tracing::error!("Authentication failed: {}", e);
            return validated
                .redirect_error(OAuthError::server_error())
                .into_response();
        }
    };

    let location = match server.issue(&validated, &principal).await {
        Ok(location) => location,
        Err(e) => return e.into_response(),
    };

    let mut response = found(&location);
    if server.policy().invalidate_session_after_authorize
        && resources.sessions.authenticate(headers).is_some()
    {
        match resources.sessions.invalidate_authentication(headers) {
            Ok(cookie) => {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            Err(e) => tracing::error!("Failed to invalidate session: {}", e),
        }
    }
    response
}

/// `/login?then=<this authorize request>`.
fn login_redirect(params: &AuthorizeRequest) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    let fields = [
        ("client_id", &params.client_id),
        ("redirect_uri", &params.redirect_uri),
        ("response_type", &params.response_type),
        ("scope", &params.scope),
        ("state", &params.state),
        ("code_challenge", &params.code_challenge),
        ("code_challenge_method", &params.code_challenge_method),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            query.append_pair(key, value);
        }
    }
    let then = format!("/oauth/authorize?{}", query.finish());
    format!("/login?then={}", urlencoding::encode(&then))
}

fn extract_client_credentials(
    headers: &HeaderMap,
    client_id: Option<&str>,
    client_secret: Option<&str>,
) -> (Option<String>, Option<String>) {
    // Try Basic auth first
    if let Some((id, secret)) = parse_basic_auth(headers) {
        return (Some(id), Some(secret));
    }

    // Fall back to form body
    (client_id.map(String::from), client_secret.map(String::from))
}

/// OAuth2 Token endpoint.
#[tracing::instrument(skip(resources, headers, params), fields(grant_type = %params.grant_type))]
#[utoipa::path(
    post,
    path = "/oauth/token",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Token",
    summary = "Obtain an access token",
    description = "Dispatches on `grant_type`. Only grant types enabled in the server policy are accepted.\n\n\
                   **Supported grant types:**\n\
                   - `authorization_code`: `code`, `redirect_uri` and `code_verifier` when PKCE was used\n\
                   - `refresh_token`: `refresh_token` and optionally a narrower `scope`\n\
                   - `password`: `username` and `password`\n\
                   - `client_credentials`: client authentication only\n\
                   - `assertion`: `assertion_type` and `assertion`\n\n\
                   **Client authentication:** HTTP Basic auth, or `client_id` and `client_secret` in the body.\n\n\
                   Failures of the code, PKCE and refresh checks all report `invalid_grant`.",
    request_body(
        content = TokenRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Token request parameters"
    ),
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 400, description = "The request was rejected", body = ErrorResponse),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
        (status = 500, description = "Store or upstream failure", body = ErrorResponse),
    )
)]
pub async fn token(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Form(params): Form<TokenRequest>,
) -> Response {
    let (client_id, client_secret) = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    );

    let server = &resources.server;
    match server
        .token(client_id.as_deref(), client_secret.as_deref(), &params)
        .await
    {
        Ok(response) => no_store(Json(response).into_response()),
        Err(e) => no_store(e.with_policy_status(server.error_status()).into_response()),
    }
}

fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// OAuth2 Token revocation endpoint (RFC 7009).
#[tracing::instrument(skip(resources, headers, params))]
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Revoke",
    summary = "Revoke an access or refresh token",
    description = "Revokes a token owned by the authenticated client. \
                   Revoking an access token also revokes its refresh token and vice versa.\n\n\
                   Unknown tokens are answered with 200 as required by RFC 7009.",
    request_body(
        content = RevokeRequest,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 200, description = "Token revoked or unknown"),
        (status = 401, description = "Client authentication failed", body = ErrorResponse),
    )
)]
pub async fn revoke(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Form(params): Form<RevokeRequest>,
) -> Response {
    let (client_id, client_secret) = extract_client_credentials(
        &headers,
        params.client_id.as_deref(),
        params.client_secret.as_deref(),
    );

    let server = &resources.server;
    match server
        .revoke(
            client_id.as_deref(),
            client_secret.as_deref(),
            &params.token,
            params.token_type_hint.as_deref(),
        )
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => e.with_policy_status(server.error_status()).into_response(),
    }
}

/// Authorization server metadata (RFC 8414).
#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/.well-known/oauth-authorization-server",
    tag = OAUTH2_TAG,
    operation_id = "OAuth2 Server Metadata",
    summary = "Authorization server metadata",
    description = "Endpoints, response types, grant types and PKCE methods supported by this server.",
    responses(
        (status = 200, description = "Server metadata document", body = ServerMetadata),
    )
)]
pub async fn metadata(State(resources): State<AppResources>) -> Json<ServerMetadata> {
    Json(resources.server.metadata(&resources.config.issuer_url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_redirect_round_trips_the_request() {
        let params = AuthorizeRequest {
            client_id: Some("A".into()),
            redirect_uri: Some("https://a.example/cb".into()),
            response_type: Some("code".into()),
            state: Some("x y".into()),
            ..Default::default()
        };
        let location = login_redirect(&params);
        let then = location.strip_prefix("/login?then=").unwrap();
        let then = urlencoding::decode(then).unwrap();
        assert_eq!(
            then,
            "/oauth/authorize?client_id=A&redirect_uri=https%3A%2F%2Fa.example%2Fcb&response_type=code&state=x+y"
        );
        assert!(crate::security::is_server_relative_url(&then));
    }

    #[test]
    fn basic_auth_wins_over_form() {
        let mut headers = HeaderMap::new();
        // A:secret
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic QTpzZWNyZXQ="),
        );
        assert_eq!(
            extract_client_credentials(&headers, Some("B"), Some("other")),
            (Some("A".to_string()), Some("secret".to_string()))
        );
        assert_eq!(
            extract_client_credentials(&HeaderMap::new(), Some("B"), None),
            (Some("B".to_string()), None)
        );
    }
}
