//! OAuth2 authorization server.
//!
//! ## Supported Flows
//!
//! - Authorization Code, with optional PKCE
//! - Implicit (`response_type=token`)
//! - Refresh Token, with configurable rotation
//! - Resource Owner Password, delegated upstream
//! - Client Credentials
//! - Assertion, delegated to an [`grants::AssertionValidator`]
//!
//! ## Endpoints
//!
//! - `GET/POST /oauth/authorize` - Authorization endpoint
//! - `POST /oauth/token` - Token endpoint
//! - `POST /oauth/revoke` - Token revocation
//! - `GET /.well-known/oauth-authorization-server` - Server metadata

pub mod client;
pub mod endpoints;
pub mod error;
pub mod grants;
pub mod password;
pub mod pkce;
pub mod server;
pub mod store;

pub use client::{Client, ClientRegistry, MemoryClientRegistry};
pub use endpoints::router;
pub use error::{OAuthError, OAuthErrorKind};
pub use server::AuthorizationServer;
pub use store::{AccessData, AuthorizeData, MemoryTokenStore, TokenStore};

use crate::error::RandomError;

/// OpenAPI tag for OAuth2 endpoints
pub const OAUTH2_TAG: &str = "OAuth2";

/// Generate an unguessable token (256 bits, base64url without padding).
pub fn generate_token() -> Result<String, RandomError> {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}
