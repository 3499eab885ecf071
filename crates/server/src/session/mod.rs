//! Browser session state carried in a signed cookie.

pub mod authenticator;
pub mod store;

pub use authenticator::SessionAuthenticator;
pub use store::{Session, SessionError, SessionStore};

use axum::http::{HeaderMap, header};

/// Value of the first cookie called `name` in the request's `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn reads_named_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_static("a=1; ssn=v1.x.y"));
        headers.append(header::COOKIE, HeaderValue::from_static("csrf=tok"));
        assert_eq!(read_cookie(&headers, "ssn").as_deref(), Some("v1.x.y"));
        assert_eq!(read_cookie(&headers, "csrf").as_deref(), Some("tok"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }
}
