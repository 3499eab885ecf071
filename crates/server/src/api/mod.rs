//! API module providing the HTTP surface of the broker.
//!
//! - `auth` - extractor resolving the calling principal
//! - `health` - Health check endpoint (/healthz)
//! - `openapi` - OpenAPI/Utoipa configuration
//! - `user` - identity endpoint (/api/user)
//!
//! The OAuth2 endpoints live in [`crate::oauth2::endpoints`] and the login
//! form in [`crate::login`]; both are mounted here.

pub mod auth;
pub mod health;
pub mod openapi;
pub mod user;

pub use health::MISC_TAG;

use crate::AppResources;
use axum::Router;
use color_eyre::eyre::WrapErr;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Builds the application router together with its OpenAPI document.
pub fn router(resources: AppResources) -> (Router, utoipa::openapi::OpenApi) {
    OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .merge(crate::oauth2::router(resources.clone()))
        .merge(crate::login::router(resources.clone()))
        .routes(routes!(user::current_user))
        .routes(routes!(health::health))
        .layer(axum::Extension(resources))
        .layer(TraceLayer::new_for_http())
        .split_for_parts()
}

/// The complete application, API docs included.
pub fn app(resources: AppResources) -> Router {
    let (router, api) = router(resources);
    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server on the configured listen address.
#[tracing::instrument(skip(resources))]
pub async fn start_webserver(resources: AppResources) -> color_eyre::Result<()> {
    let addr = resources.config.listen_addr.clone();
    let router = app(resources);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {addr}"))?;
    tracing::info!(addr = %addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
