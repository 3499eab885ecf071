//! Double-submit cookie CSRF protection.
//!
//! The token lives in an HttpOnly cookie and is echoed in a hidden form
//! field. A submission is accepted only when both are present and equal.

use crate::config::SameSite;
use crate::error::RandomError;
use crate::oauth2::generate_token;
use crate::session::read_cookie;
use axum::http::{HeaderMap, HeaderValue};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CsrfError {
    #[error(transparent)]
    Random(#[from] RandomError),
    #[error("Invalid CSRF cookie: {0}")]
    Cookie(String),
}

#[derive(Clone, Debug)]
pub struct CsrfGuard {
    cookie_name: String,
    secure: bool,
    same_site: SameSite,
}

impl CsrfGuard {
    pub fn new(cookie_name: impl Into<String>, secure: bool, same_site: SameSite) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            secure,
            same_site,
        }
    }

    /// Token to embed in a form. Reuses the request's cookie when present,
    /// otherwise mints one and returns the `Set-Cookie` header to send.
    pub fn generate(
        &self,
        headers: &HeaderMap,
    ) -> Result<(String, Option<HeaderValue>), CsrfError> {
        if let Some(existing) = read_cookie(headers, &self.cookie_name).filter(|t| !t.is_empty()) {
            return Ok((existing, None));
        }
        let token = generate_token()?;
        let cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite={}{}",
            self.cookie_name,
            token,
            self.same_site.as_str(),
            if self.secure { "; Secure" } else { "" }
        );
        let header = HeaderValue::from_str(&cookie).map_err(|e| CsrfError::Cookie(e.to_string()))?;
        Ok((token, Some(header)))
    }

    /// Constant-time comparison of the submitted value with the cookie.
    pub fn check(&self, headers: &HeaderMap, submitted: &str) -> bool {
        let Some(expected) = read_cookie(headers, &self.cookie_name) else {
            tracing::warn!("CSRF check failed: no token cookie");
            return false;
        };
        if expected.is_empty() || submitted.is_empty() {
            tracing::warn!("CSRF check failed: empty token");
            return false;
        }
        let matches: bool = expected.as_bytes().ct_eq(submitted.as_bytes()).into();
        if !matches {
            tracing::warn!("CSRF check failed: token mismatch");
        }
        matches
    }
}
