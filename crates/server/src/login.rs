//! Login and logout endpoints.
//!
//! Implements the browser side of authentication:
//! - Login page (GET)
//! - Login submission (POST)
//! - Logout (POST)

use crate::AppResources;
use crate::oauth2::error::found;
use crate::oauth2::password::PasswordOutcome;
use crate::security::is_server_relative_url;
use askama::Template;
use axum::{
    Form,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::ToSchema;
use utoipa_axum::{router::OpenApiRouter, routes};

/// OpenAPI tag for login endpoints
pub const LOGIN_TAG: &str = "Login";

const INVALID_CREDENTIALS: &str = "Invalid login or password";
const AUTHENTICATION_ERROR: &str = "An authentication error occurred";
const FORM_EXPIRED: &str = "The form has expired, please try again";

/// Login page template.
#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    then: String,
    csrf: String,
    username: String,
    error: Option<String>,
}

/// Query parameters for the login page.
#[derive(Debug, Deserialize)]
pub struct LoginQuery {
    pub then: Option<String>,
}

/// Form data for login submission.
#[derive(Deserialize, ToSchema)]
pub struct LoginForm {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub csrf: String,
    #[serde(default)]
    pub then: String,
}

/// Form data for logout.
#[derive(Debug, Deserialize, ToSchema)]
pub struct LogoutForm {
    #[serde(default)]
    pub csrf: String,
    #[serde(default)]
    pub then: String,
}

/// Creates the login router.
pub fn router(resources: AppResources) -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(login_page, login_submit))
        .routes(routes!(logout))
        .with_state(resources)
}

/// `then` when it stays on this server, `/` otherwise.
fn safe_then(then: Option<&str>) -> String {
    match then {
        Some(url) if is_server_relative_url(url) => url.to_string(),
        Some(url) if !url.is_empty() => {
            tracing::warn!(redirect = %url, "Rejected non-relative redirect target");
            "/".to_string()
        }
        _ => "/".to_string(),
    }
}

fn render_form(
    resources: &AppResources,
    headers: &HeaderMap,
    status: StatusCode,
    then: String,
    username: String,
    error: Option<&str>,
) -> Response {
    let (csrf, cookie) = match resources.csrf.generate(headers) {
        Ok(pair) => pair,
        Err(e) => {
            tracing::error!("Failed to generate CSRF token: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    let template = LoginTemplate {
        then,
        csrf,
        username,
        error: error.map(String::from),
    };

    let mut response = match template.render() {
        Ok(html) => (status, Html(html)).into_response(),
        Err(e) => {
            tracing::error!("Failed to render login template: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    if let Some(cookie) = cookie {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Display the login page.
#[tracing::instrument(skip(resources, headers))]
#[utoipa::path(
    get,
    path = "/login",
    tag = LOGIN_TAG,
    operation_id = "Login Page",
    summary = "Display the login form",
    description = "Renders the login form. `then` is where the browser goes after a successful login; \
                   anything that is not a path on this server is replaced by `/`.",
    params(
        ("then" = Option<String>, Query, description = "Server-relative URL to continue to after login."),
    ),
    responses(
        (status = 200, description = "Login form", content_type = "text/html", body = String),
    )
)]
pub async fn login_page(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Query(query): Query<LoginQuery>,
) -> Response {
    let then = safe_then(query.then.as_deref());
    render_form(&resources, &headers, StatusCode::OK, then, String::new(), None)
}

/// Handle login form submission.
#[tracing::instrument(skip(resources, headers, form))]
#[utoipa::path(
    post,
    path = "/login",
    tag = LOGIN_TAG,
    operation_id = "Login Submit",
    summary = "Submit login credentials",
    description = "Checks the CSRF token, then the credentials against the upstream credential source. \
                   On success the session cookie is set and the browser is sent to `then`.\n\n\
                   Failures show a generic message that does not tell unknown users from wrong passwords.",
    request_body(
        content = LoginForm,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 302, description = "Logged in, redirect to `then`"),
        (status = 401, description = "Invalid login or password", content_type = "text/html", body = String),
        (status = 403, description = "CSRF check failed", content_type = "text/html", body = String),
        (status = 500, description = "Upstream failure", content_type = "text/html", body = String),
    )
)]
pub async fn login_submit(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    if !resources.csrf.check(&headers, &form.csrf) {
        let then = safe_then(Some(&form.then));
        return render_form(
            &resources,
            &headers,
            StatusCode::FORBIDDEN,
            then,
            form.username,
            Some(FORM_EXPIRED),
        );
    }
    let then = safe_then(Some(&form.then));

    let Some(delegate) = &resources.password else {
        tracing::error!("Login attempted without a configured credential source");
        return render_form(
            &resources,
            &headers,
            StatusCode::INTERNAL_SERVER_ERROR,
            then,
            form.username,
            Some(AUTHENTICATION_ERROR),
        );
    };

    let principal = match delegate
        .authenticate_password(&form.username, &form.password)
        .await
    {
        Ok(PasswordOutcome::Granted(principal)) => principal,
        Ok(PasswordOutcome::Denied) => {
            tracing::info!(username = %form.username, "Login denied");
            return render_form(
                &resources,
                &headers,
                StatusCode::UNAUTHORIZED,
                then,
                form.username,
                Some(INVALID_CREDENTIALS),
            );
        }
        Err(e) => {
            tracing::error!("Login failed: {}", e);
            return render_form(
                &resources,
                &headers,
                StatusCode::INTERNAL_SERVER_ERROR,
                then,
                form.username,
                Some(AUTHENTICATION_ERROR),
            );
        }
    };

    match resources
        .sessions
        .authentication_succeeded(&headers, &principal)
    {
        Ok(cookie) => {
            tracing::info!(user = %principal.name, "Login succeeded");
            with_cookie(found(&then), cookie)
        }
        Err(e) => {
            tracing::error!("Failed to write session: {}", e);
            render_form(
                &resources,
                &headers,
                StatusCode::INTERNAL_SERVER_ERROR,
                then,
                form.username,
                Some(AUTHENTICATION_ERROR),
            )
        }
    }
}

/// End the browser session.
#[tracing::instrument(skip(resources, headers, form))]
#[utoipa::path(
    post,
    path = "/logout",
    tag = LOGIN_TAG,
    operation_id = "Logout",
    summary = "Log out",
    description = "Checks the CSRF token, expires the session and redirects to `then` (or `/`).",
    request_body(
        content = LogoutForm,
        content_type = "application/x-www-form-urlencoded",
    ),
    responses(
        (status = 302, description = "Logged out"),
        (status = 403, description = "CSRF check failed"),
    )
)]
pub async fn logout(
    State(resources): State<AppResources>,
    headers: HeaderMap,
    Form(form): Form<LogoutForm>,
) -> Response {
    if !resources.csrf.check(&headers, &form.csrf) {
        return (StatusCode::FORBIDDEN, FORM_EXPIRED).into_response();
    }
    let then = safe_then(Some(&form.then));
    match resources.sessions.invalidate_authentication(&headers) {
        Ok(cookie) => with_cookie(found(&then), cookie),
        Err(e) => {
            tracing::error!("Failed to invalidate session: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

fn with_cookie(mut response: Response, cookie: HeaderValue) -> Response {
    response.headers_mut().append(header::SET_COOKIE, cookie);
    response
}
