//! Username/password authentication against an upstream credential source.

use crate::authenticator::Principal;
use crate::config::UpstreamConfig;
use crate::error::DelegateError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Method, Request, StatusCode, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Result of a password check that reached the credential source.
///
/// `Denied` is a soft failure: the source answered and said no. Hard
/// failures (the source could not answer) are reported as `DelegateError`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PasswordOutcome {
    Granted(Principal),
    Denied,
}

#[async_trait]
pub trait PasswordGrantDelegate: Send + Sync {
    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<PasswordOutcome, DelegateError>;
}

/// Identity as reported by the upstream provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamIdentity {
    pub provider: String,
    pub sub: String,
    pub preferred_username: Option<String>,
}

/// Maps an upstream identity onto a local principal.
pub trait IdentityMapper: Send + Sync {
    fn map_identity(&self, identity: &UpstreamIdentity) -> Result<Principal, DelegateError>;
}

/// `uid = "<provider>:<sub>"`, name from `preferred_username` or `sub`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultIdentityMapper;

impl IdentityMapper for DefaultIdentityMapper {
    fn map_identity(&self, identity: &UpstreamIdentity) -> Result<Principal, DelegateError> {
        if identity.sub.is_empty() {
            return Err(DelegateError::Protocol("upstream identity has no subject".into()));
        }
        let name = identity
            .preferred_username
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(&identity.sub);
        Ok(Principal::new(
            name,
            format!("{}:{}", identity.provider, identity.sub),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamToken {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct UpstreamUserInfo {
    sub: String,
    #[serde(default)]
    preferred_username: Option<String>,
}

type HttpsClient<B> = Client<hyper_rustls::HttpsConnector<HttpConnector>, B>;

/// Forwards credentials to an upstream OAuth2 token endpoint using the
/// resource owner password grant, then resolves the identity through the
/// upstream userinfo endpoint.
pub struct UpstreamPasswordDelegate {
    config: UpstreamConfig,
    mapper: Arc<dyn IdentityMapper>,
    form_client: HttpsClient<Full<Bytes>>,
    get_client: HttpsClient<Empty<Bytes>>,
}

impl UpstreamPasswordDelegate {
    pub fn new(config: UpstreamConfig) -> Result<Self, DelegateError> {
        Self::with_mapper(config, Arc::new(DefaultIdentityMapper))
    }

    pub fn with_mapper(
        config: UpstreamConfig,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Result<Self, DelegateError> {
        let connector = || -> Result<_, DelegateError> {
            Ok(hyper_rustls::HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
                .map_err(|e| DelegateError::Network(format!("TLS setup failed: {e}")))?
                .https_or_http()
                .enable_http1()
                .build())
        };
        Ok(Self {
            config,
            mapper,
            form_client: Client::builder(TokioExecutor::new()).build(connector()?),
            get_client: Client::builder(TokioExecutor::new()).build(connector()?),
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    async fn exchange(
        &self,
        username: &str,
        password: &str,
    ) -> Result<PasswordOutcome, DelegateError> {
        // The serializer is not Send and must be dropped before the first await.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("grant_type", "password")
                .append_pair("username", username)
                .append_pair("password", password)
                .append_pair("client_id", &self.config.client_id);
            if let Some(secret) = &self.config.client_secret {
                form.append_pair("client_secret", secret);
            }
            form.finish()
        };

        let request = Request::builder()
            .method(Method::POST)
            .uri(&self.config.token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| DelegateError::Protocol(e.to_string()))?;

        let response = self
            .form_client
            .request(request)
            .await
            .map_err(|e| DelegateError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DelegateError::Network(e.to_string()))?
            .to_bytes();

        if status == StatusCode::UNAUTHORIZED {
            return Ok(PasswordOutcome::Denied);
        }
        if status == StatusCode::BAD_REQUEST {
            return match serde_json::from_slice::<UpstreamError>(&body) {
                Ok(e) if e.error == "invalid_grant" || e.error == "access_denied" => {
                    Ok(PasswordOutcome::Denied)
                }
                Ok(e) => Err(DelegateError::Protocol(format!(
                    "upstream rejected request: {}",
                    e.error
                ))),
                Err(_) => Err(DelegateError::Protocol(
                    "upstream returned 400 without an OAuth2 error".into(),
                )),
            };
        }
        if !status.is_success() {
            return Err(DelegateError::Protocol(format!(
                "upstream token endpoint returned {status}"
            )));
        }

        let token: UpstreamToken = serde_json::from_slice(&body)
            .map_err(|e| DelegateError::Protocol(format!("invalid token response: {e}")))?;
        let identity = self.user_info(&token.access_token).await?;
        Ok(PasswordOutcome::Granted(self.mapper.map_identity(&identity)?))
    }

    async fn user_info(&self, access_token: &str) -> Result<UpstreamIdentity, DelegateError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(&self.config.userinfo_url)
            .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| DelegateError::Protocol(e.to_string()))?;

        let response = self
            .get_client
            .request(request)
            .await
            .map_err(|e| DelegateError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DelegateError::Protocol(format!(
                "upstream userinfo endpoint returned {status}"
            )));
        }
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| DelegateError::Network(e.to_string()))?
            .to_bytes();
        let info: UpstreamUserInfo = serde_json::from_slice(&body)
            .map_err(|e| DelegateError::Protocol(format!("invalid userinfo response: {e}")))?;

        Ok(UpstreamIdentity {
            provider: self.config.provider_name.clone(),
            sub: info.sub,
            preferred_username: info.preferred_username,
        })
    }
}

#[async_trait]
impl PasswordGrantDelegate for UpstreamPasswordDelegate {
    #[tracing::instrument(skip(self, password), fields(provider = %self.config.provider_name))]
    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<PasswordOutcome, DelegateError> {
        let limit = self.timeout();
        match tokio::time::timeout(limit, self.exchange(username, password)).await {
            Ok(result) => result,
            Err(_) => Err(DelegateError::Timeout(limit)),
        }
    }
}
