//! Request authentication chain.
//!
//! A [`RequestAuthenticator`] answers "who sent this request". Three outcomes
//! are distinguished: a principal, no principal (`Ok(None)`, the request is
//! simply anonymous), and a hard failure of some backend (`Err`).

use crate::error::{DelegateError, StoreError};
use crate::oauth2::password::{PasswordGrantDelegate, PasswordOutcome};
use crate::oauth2::store::TokenStore;
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use utoipa::ToSchema;

/// An authenticated identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct Principal {
    pub name: String,
    /// Stable unique id, independent of renames
    pub uid: String,
}

impl Principal {
    pub fn new(name: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error(transparent)]
    Delegate(#[from] DelegateError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, AuthenticationError>;
}

/// Tries each member in order and returns the first principal found.
///
/// An error from one member does not stop the chain. It is returned only if
/// no later member authenticates the request.
#[derive(Clone, Default)]
pub struct UnionAuthenticator {
    members: Vec<Arc<dyn RequestAuthenticator>>,
}

impl UnionAuthenticator {
    pub fn new(members: Vec<Arc<dyn RequestAuthenticator>>) -> Self {
        Self { members }
    }

    pub fn with(mut self, member: Arc<dyn RequestAuthenticator>) -> Self {
        self.members.push(member);
        self
    }
}

#[async_trait]
impl RequestAuthenticator for UnionAuthenticator {
    async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, AuthenticationError> {
        let mut first_error = None;
        for member in &self.members {
            match member.authenticate_request(headers).await {
                Ok(Some(principal)) => return Ok(Some(principal)),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!("Authenticator failed, trying next: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

/// Decode `Authorization: Basic <base64(user:pass)>`.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<(String, String)> {
    let encoded = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let (user, pass) = creds.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Extract `Authorization: Bearer <token>`.
pub fn parse_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// HTTP Basic credentials checked against the password delegate.
pub struct BasicAuthAuthenticator {
    delegate: Arc<dyn PasswordGrantDelegate>,
}

impl BasicAuthAuthenticator {
    pub fn new(delegate: Arc<dyn PasswordGrantDelegate>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl RequestAuthenticator for BasicAuthAuthenticator {
    async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, AuthenticationError> {
        let Some((username, password)) = parse_basic_auth(headers) else {
            return Ok(None);
        };
        match self
            .delegate
            .authenticate_password(&username, &password)
            .await?
        {
            PasswordOutcome::Granted(principal) => Ok(Some(principal)),
            PasswordOutcome::Denied => Ok(None),
        }
    }
}

/// Access tokens issued by this server.
pub struct BearerTokenAuthenticator {
    store: Arc<dyn TokenStore>,
}

impl BearerTokenAuthenticator {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RequestAuthenticator for BearerTokenAuthenticator {
    async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, AuthenticationError> {
        let Some(token) = parse_bearer(headers) else {
            return Ok(None);
        };
        match self.store.load_access_data(token).await {
            // Client credential tokens carry no end user
            Ok(data) => Ok(data.user_data),
            Err(e) if e.is_credential_failure() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    struct Fixed(Result<Option<Principal>, ()>);

    #[async_trait]
    impl RequestAuthenticator for Fixed {
        async fn authenticate_request(
            &self,
            _headers: &HeaderMap,
        ) -> Result<Option<Principal>, AuthenticationError> {
            self.0
                .clone()
                .map_err(|_| StoreError::Backend("down".into()).into())
        }
    }

    fn fixed(r: Result<Option<Principal>, ()>) -> Arc<dyn RequestAuthenticator> {
        Arc::new(Fixed(r))
    }

    #[tokio::test]
    async fn union_returns_first_success() {
        let union = UnionAuthenticator::default()
            .with(fixed(Ok(None)))
            .with(fixed(Err(())))
            .with(fixed(Ok(Some(Principal::new("bob", "1")))));
        let principal = union
            .authenticate_request(&HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(principal, Some(Principal::new("bob", "1")));
    }

    #[tokio::test]
    async fn union_surfaces_error_only_without_success() {
        let union = UnionAuthenticator::new(vec![fixed(Err(())), fixed(Ok(None))]);
        assert!(union.authenticate_request(&HeaderMap::new()).await.is_err());

        let empty = UnionAuthenticator::default();
        assert!(
            empty
                .authenticate_request(&HeaderMap::new())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn basic_auth_parsing() {
        let mut headers = HeaderMap::new();
        // bob:pa:ss
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic Ym9iOnBhOnNz"),
        );
        assert_eq!(
            parse_basic_auth(&headers),
            Some(("bob".to_string(), "pa:ss".to_string()))
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic !!"));
        assert_eq!(parse_basic_auth(&headers), None);
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_bearer(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(parse_bearer(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(parse_bearer(&headers), None);
    }

    #[tokio::test]
    async fn expired_bearer_token_is_anonymous() {
        use crate::oauth2::store::{AccessData, MemoryTokenStore};
        use time::{Duration, OffsetDateTime};

        let store = Arc::new(MemoryTokenStore::new());
        let token = |access: &str, created_at: OffsetDateTime| AccessData {
            access_token: access.to_string(),
            refresh_token: None,
            client_id: "A".into(),
            authorize_code: None,
            previous_access_token: None,
            scope: String::new(),
            redirect_uri: None,
            created_at,
            expires_in: 300,
            user_data: Some(Principal::new("bob", "idp:bob")),
        };
        let now = OffsetDateTime::now_utc();
        store.create_access_data(token("live", now)).await.unwrap();
        store
            .create_access_data(token("stale", now - Duration::seconds(300)))
            .await
            .unwrap();

        let bearer = BearerTokenAuthenticator::new(store);
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer live"));
        assert_eq!(
            bearer.authenticate_request(&headers).await.unwrap(),
            Some(Principal::new("bob", "idp:bob"))
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        assert_eq!(bearer.authenticate_request(&headers).await.unwrap(), None);
    }
}
