//! OAuth2 authorization server and browser session layer.
//!
//! The library wires an [`oauth2::AuthorizationServer`] to signed cookie
//! sessions, a login form and an HTTP API. Clients and tokens are reached
//! through the [`oauth2::ClientRegistry`] and [`oauth2::TokenStore`] traits;
//! in-memory implementations of both are included.

use std::sync::Arc;

use crate::authenticator::{
    BasicAuthAuthenticator, BearerTokenAuthenticator, RequestAuthenticator, UnionAuthenticator,
};
use crate::config::AppConfig;
use crate::oauth2::grants::AssertionValidator;
use crate::oauth2::password::PasswordGrantDelegate;
use crate::oauth2::{AuthorizationServer, ClientRegistry, TokenStore};
use crate::security::CsrfGuard;
use crate::session::{SessionAuthenticator, SessionStore};

pub mod api;
pub mod authenticator;
pub mod config;
pub mod error;
pub mod login;
pub mod oauth2;
pub mod security;
pub mod session;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppResources {
    pub config: Arc<AppConfig>,
    pub server: Arc<AuthorizationServer>,
    pub sessions: SessionAuthenticator,
    pub csrf: CsrfGuard,
    /// Credential source for the login form and the password grant
    pub password: Option<Arc<dyn PasswordGrantDelegate>>,
    /// Session, then Basic credentials, then bearer tokens
    pub authenticator: Arc<dyn RequestAuthenticator>,
    /// End-user login at the authorize endpoint: session, then Basic credentials
    pub authorize_authenticator: Arc<dyn RequestAuthenticator>,
}

impl AppResources {
    pub fn new(
        config: AppConfig,
        clients: Arc<dyn ClientRegistry>,
        store: Arc<dyn TokenStore>,
        password: Option<Arc<dyn PasswordGrantDelegate>>,
        assertion: Option<Arc<dyn AssertionValidator>>,
    ) -> Self {
        let mut server = AuthorizationServer::new(config.oauth.clone(), clients, store.clone());
        if let Some(delegate) = &password {
            server = server.with_password_delegate(delegate.clone());
        }
        if let Some(validator) = assertion {
            server = server.with_assertion_validator(validator);
        }

        let sessions = SessionAuthenticator::new(Arc::new(SessionStore::new(&config.session)));
        let csrf = CsrfGuard::new(
            config.csrf.cookie_name.clone(),
            config.session.secure,
            config.session.same_site,
        );

        let mut login = UnionAuthenticator::default().with(Arc::new(sessions.clone()));
        if let Some(delegate) = &password {
            login = login.with(Arc::new(BasicAuthAuthenticator::new(delegate.clone())));
        }
        // Access tokens never stand in for a logged-in user at authorize time.
        let chain = login
            .clone()
            .with(Arc::new(BearerTokenAuthenticator::new(store)));

        Self {
            config: Arc::new(config),
            server: Arc::new(server),
            sessions,
            csrf,
            password,
            authenticator: Arc::new(chain),
            authorize_authenticator: Arc::new(login),
        }
    }
}
