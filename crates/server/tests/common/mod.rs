//! Shared fixtures for the HTTP tests.
#![allow(dead_code)]

use async_trait::async_trait;
use auth_broker::AppResources;
use auth_broker::authenticator::Principal;
use auth_broker::config::AppConfig;
use auth_broker::error::DelegateError;
use auth_broker::oauth2::password::{PasswordGrantDelegate, PasswordOutcome};
use auth_broker::oauth2::{Client, MemoryClientRegistry, MemoryTokenStore};
use axum::http::{HeaderMap, HeaderValue, header};
use axum_test::{TestResponse, TestServer};
use std::sync::Arc;

pub const CLIENT_ID: &str = "A";
pub const CLIENT_SECRET: &str = "a-secret";
pub const REDIRECT_URI: &str = "https://a.example/cb";

pub const BASE_CONFIG: &str = r#"
issuer_url: "https://oauth.example.com/"
oauth:
  invalidate_session_after_authorize: false
session:
  secrets: ["test-secret-0123456789abcdef0123456789"]
  secure: false
clients:
  - id: "A"
    secret: "a-secret"
    redirect_uris: ["https://a.example/cb"]
  - id: "public"
    redirect_uris: ["http://127.0.0.1:8400/callback"]
    grant_types: ["authorization_code", "refresh_token"]
"#;

pub fn parse_config(yaml: &str) -> AppConfig {
    config::Config::builder()
        .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
        .build()
        .expect("build config")
        .try_deserialize()
        .expect("deserialize config")
}

pub fn test_config() -> AppConfig {
    parse_config(BASE_CONFIG)
}

/// Accepts `bob`/`right`, fails hard for `broken`, denies everything else.
pub struct FakePasswords;

#[async_trait]
impl PasswordGrantDelegate for FakePasswords {
    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<PasswordOutcome, DelegateError> {
        match (username, password) {
            ("bob", "right") => Ok(PasswordOutcome::Granted(bob())),
            ("broken", _) => Err(DelegateError::Network("connection refused".into())),
            _ => Ok(PasswordOutcome::Denied),
        }
    }
}

pub fn bob() -> Principal {
    Principal::new("bob", "test:bob")
}

pub struct TestApp {
    pub server: TestServer,
    pub resources: AppResources,
    pub store: Arc<MemoryTokenStore>,
}

pub fn app_with(config: AppConfig, password: Option<Arc<dyn PasswordGrantDelegate>>) -> TestApp {
    let clients = Arc::new(MemoryClientRegistry::from_clients(
        config.clients.iter().cloned().map(Client::from),
    ));
    let store = Arc::new(MemoryTokenStore::new());
    let resources = AppResources::new(config, clients, store.clone(), password, None);
    let server = TestServer::new(auth_broker::api::app(resources.clone()))
        .expect("create test server");
    TestApp {
        server,
        resources,
        store,
    }
}

pub fn app(config: AppConfig) -> TestApp {
    app_with(config, Some(Arc::new(FakePasswords)))
}

impl TestApp {
    /// `Cookie` header value for a live session of `principal`.
    pub fn session_cookie(&self, principal: &Principal) -> HeaderValue {
        let set_cookie = self
            .resources
            .sessions
            .authentication_succeeded(&HeaderMap::new(), principal)
            .expect("write session");
        cookie_pair(&set_cookie)
    }

    /// Run the code flow for `bob` and return the authorization code.
    pub async fn authorize_code(&self, extra: &[(&str, &str)]) -> String {
        let mut request = self
            .server
            .get("/oauth/authorize")
            .add_query_param("client_id", CLIENT_ID)
            .add_query_param("redirect_uri", REDIRECT_URI)
            .add_query_param("response_type", "code")
            .add_header(header::COOKIE, self.session_cookie(&bob()));
        for (key, value) in extra {
            request = request.add_query_param(key, value);
        }
        let response = request.await;
        response.assert_status(axum::http::StatusCode::FOUND);
        query_param(&location(&response), "code").expect("code in redirect")
    }
}

/// `name=value` part of a `Set-Cookie` header, usable as a `Cookie` header.
pub fn cookie_pair(set_cookie: &HeaderValue) -> HeaderValue {
    let text = set_cookie.to_str().expect("ascii cookie");
    let pair = text.split(';').next().unwrap_or_default();
    HeaderValue::from_str(pair).expect("cookie pair")
}

/// The `Set-Cookie` header of `response` for cookie `name`.
pub fn set_cookie(response: &TestResponse, name: &str) -> Option<HeaderValue> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .find(|v| {
            v.to_str()
                .is_ok_and(|s| s.starts_with(&format!("{name}=")))
        })
        .cloned()
}

pub fn location(response: &TestResponse) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .expect("location header")
        .to_string()
}

pub fn query_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn fragment_param(location: &str, name: &str) -> Option<String> {
    let url = url::Url::parse(location).ok()?;
    url::form_urlencoded::parse(url.fragment()?.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// `Authorization: Basic` header for the given credentials.
pub fn basic(id: &str, secret: &str) -> HeaderValue {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{id}:{secret}"));
    HeaderValue::from_str(&format!("Basic {encoded}")).expect("basic header")
}
