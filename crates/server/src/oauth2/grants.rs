//! Token endpoint grant types.
//!
//! Each enabled grant type maps to one [`GrantHandler`] in a table built at
//! startup. A handler checks the grant-specific parameters and describes what
//! to issue; minting and persisting the tokens is left to the server so every
//! grant issues tokens the same way.

use crate::authenticator::Principal;
use crate::error::{DelegateError, StoreError};
use crate::oauth2::client::Client;
use crate::oauth2::error::{OAuthError, OAuthErrorKind};
use crate::oauth2::password::{PasswordGrantDelegate, PasswordOutcome};
use crate::oauth2::pkce::{self, CodeChallengeMethod};
use crate::oauth2::store::TokenStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    Password,
    ClientCredentials,
    Assertion,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
            GrantType::Password => "password",
            GrantType::ClientCredentials => "client_credentials",
            GrantType::Assertion => "assertion",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = OAuthError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            "password" => Ok(GrantType::Password),
            "client_credentials" => Ok(GrantType::ClientCredentials),
            "assertion" => Ok(GrantType::Assertion),
            _ => Err(OAuthError::new(OAuthErrorKind::UnsupportedGrantType)),
        }
    }
}

/// Token endpoint parameters. Which fields are required depends on the grant.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    #[serde(default)]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub scope: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub assertion_type: Option<String>,
    pub assertion: Option<String>,
}

/// What a successful grant entitles the client to.
#[derive(Clone, Debug, PartialEq)]
pub struct GrantOutcome {
    pub scope: String,
    pub user_data: Option<Principal>,
    pub authorize_code: Option<String>,
    pub previous_access_token: Option<String>,
    pub redirect_uri: Option<String>,
    /// Whether this grant may come with a refresh token
    pub refresh_allowed: bool,
}

impl GrantOutcome {
    fn new(scope: String, user_data: Option<Principal>) -> Self {
        Self {
            scope,
            user_data,
            authorize_code: None,
            previous_access_token: None,
            redirect_uri: None,
            refresh_allowed: true,
        }
    }
}

/// One grant type. `client` has already been authenticated.
#[async_trait]
pub trait GrantHandler: Send + Sync {
    async fn grant(&self, client: &Client, request: &TokenRequest)
    -> Result<GrantOutcome, OAuthError>;
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("{name} is required")))
}

fn store_failure(e: StoreError) -> OAuthError {
    if e.is_credential_failure() {
        OAuthError::invalid_grant()
    } else {
        tracing::error!("Token store failure: {}", e);
        OAuthError::server_error()
    }
}

/// Whether every scope token in `requested` is present in `granted`.
pub fn is_scope_subset(requested: &str, granted: &str) -> bool {
    let granted: Vec<&str> = granted.split_whitespace().collect();
    requested
        .split_whitespace()
        .all(|scope| granted.contains(&scope))
}

pub struct AuthorizationCodeGrant {
    store: Arc<dyn TokenStore>,
}

impl AuthorizationCodeGrant {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GrantHandler for AuthorizationCodeGrant {
    async fn grant(
        &self,
        client: &Client,
        request: &TokenRequest,
    ) -> Result<GrantOutcome, OAuthError> {
        let code = required(&request.code, "code")?;

        // Removed here whatever happens next, so a code is never usable twice
        let data = match self.store.take_authorize_data(code).await {
            Ok(data) => data,
            Err(StoreError::NotFound) => {
                tracing::warn!(client_id = %client.id, "Unknown or already used authorization code");
                return Err(OAuthError::invalid_grant());
            }
            Err(e) => return Err(store_failure(e)),
        };

        if data.client_id != client.id {
            tracing::warn!(client_id = %client.id, "Authorization code presented by another client");
            return Err(OAuthError::invalid_grant());
        }

        let presented_uri = match request.redirect_uri.as_deref() {
            Some(uri) if !uri.is_empty() => Some(uri.to_string()),
            _ => client.resolve_redirect_uri(None),
        };
        if presented_uri.as_deref() != Some(data.redirect_uri.as_str()) {
            tracing::warn!(client_id = %client.id, "redirect_uri differs from authorize request");
            return Err(OAuthError::invalid_grant());
        }

        if let Some(challenge) = &data.code_challenge {
            let method = data
                .code_challenge_method
                .unwrap_or(CodeChallengeMethod::Plain);
            let verified = request
                .code_verifier
                .as_deref()
                .is_some_and(|verifier| pkce::verify(challenge, method, verifier));
            if !verified {
                tracing::warn!(client_id = %client.id, "PKCE verification failed");
                return Err(OAuthError::invalid_grant());
            }
        }

        let mut outcome = GrantOutcome::new(data.scope, Some(data.user_data));
        outcome.authorize_code = Some(data.code);
        outcome.redirect_uri = Some(data.redirect_uri);
        Ok(outcome)
    }
}

pub struct RefreshTokenGrant {
    store: Arc<dyn TokenStore>,
    revoke_rotated: bool,
}

impl RefreshTokenGrant {
    /// With `revoke_rotated` set, the presented refresh token and the access
    /// token it was issued with stop working once exchanged.
    pub fn new(store: Arc<dyn TokenStore>, revoke_rotated: bool) -> Self {
        Self {
            store,
            revoke_rotated,
        }
    }
}

#[async_trait]
impl GrantHandler for RefreshTokenGrant {
    async fn grant(
        &self,
        client: &Client,
        request: &TokenRequest,
    ) -> Result<GrantOutcome, OAuthError> {
        let token = required(&request.refresh_token, "refresh_token")?;

        let previous = self.store.load_refresh(token).await.map_err(store_failure)?;
        if previous.client_id != client.id {
            tracing::warn!(client_id = %client.id, "Refresh token presented by another client");
            return Err(OAuthError::invalid_grant());
        }

        let scope = match request.scope.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(requested) if !is_scope_subset(requested, &previous.scope) => {
                return Err(OAuthError::new(OAuthErrorKind::InvalidScope)
                    .with_description("Requested scope exceeds the original grant"));
            }
            Some(requested) => requested.to_string(),
            None => previous.scope.clone(),
        };

        if self.revoke_rotated {
            // A concurrent refresh may have won the race since the load
            self.store
                .take_refresh_token(token)
                .await
                .map_err(store_failure)?;
            self.store
                .remove_access_data(&previous.access_token)
                .await
                .map_err(store_failure)?;
        }

        let mut outcome = GrantOutcome::new(scope, previous.user_data);
        outcome.previous_access_token = Some(previous.access_token);
        outcome.redirect_uri = previous.redirect_uri;
        outcome.authorize_code = previous.authorize_code;
        Ok(outcome)
    }
}

pub struct PasswordGrant {
    delegate: Arc<dyn PasswordGrantDelegate>,
}

impl PasswordGrant {
    pub fn new(delegate: Arc<dyn PasswordGrantDelegate>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl GrantHandler for PasswordGrant {
    async fn grant(
        &self,
        _client: &Client,
        request: &TokenRequest,
    ) -> Result<GrantOutcome, OAuthError> {
        let username = required(&request.username, "username")?;
        let password = required(&request.password, "password")?;

        match self.delegate.authenticate_password(username, password).await? {
            PasswordOutcome::Granted(principal) => Ok(GrantOutcome::new(
                request.scope.clone().unwrap_or_default(),
                Some(principal),
            )),
            PasswordOutcome::Denied => Err(OAuthError::new(OAuthErrorKind::AccessDenied)),
        }
    }
}

#[derive(Default)]
pub struct ClientCredentialsGrant;

#[async_trait]
impl GrantHandler for ClientCredentialsGrant {
    async fn grant(
        &self,
        client: &Client,
        request: &TokenRequest,
    ) -> Result<GrantOutcome, OAuthError> {
        // A public client has nothing to prove its identity with
        if client.is_public() {
            return Err(OAuthError::new(OAuthErrorKind::UnauthorizedClient)
                .with_description("Public clients cannot use client_credentials"));
        }
        let mut outcome = GrantOutcome::new(request.scope.clone().unwrap_or_default(), None);
        outcome.refresh_allowed = false;
        Ok(outcome)
    }
}

/// Validates third-party assertions presented with the assertion grant.
#[async_trait]
pub trait AssertionValidator: Send + Sync {
    /// `Ok(None)` rejects the assertion.
    async fn validate_assertion(
        &self,
        client: &Client,
        assertion_type: &str,
        assertion: &str,
    ) -> Result<Option<Principal>, DelegateError>;
}

pub struct AssertionGrant {
    validator: Arc<dyn AssertionValidator>,
}

impl AssertionGrant {
    pub fn new(validator: Arc<dyn AssertionValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl GrantHandler for AssertionGrant {
    async fn grant(
        &self,
        client: &Client,
        request: &TokenRequest,
    ) -> Result<GrantOutcome, OAuthError> {
        let assertion_type = required(&request.assertion_type, "assertion_type")?;
        let assertion = required(&request.assertion, "assertion")?;

        match self
            .validator
            .validate_assertion(client, assertion_type, assertion)
            .await?
        {
            Some(principal) => {
                let mut outcome =
                    GrantOutcome::new(request.scope.clone().unwrap_or_default(), Some(principal));
                outcome.refresh_allowed = false;
                Ok(outcome)
            }
            None => Err(OAuthError::invalid_grant()),
        }
    }
}
