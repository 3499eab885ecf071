//! The authorization server engine.
//!
//! An authorize request moves through validation in a fixed order: the
//! client, then its redirect URI, then the response type. Until the redirect
//! URI is known to belong to the client, errors are rendered locally and never
//! sent to the presented URI. [`AuthorizationServer::validate_authorize`]
//! returns a [`ValidatedAuthorize`] only once that boundary is crossed; the
//! caller then authenticates the user and hands the principal to
//! [`AuthorizationServer::issue`].

use crate::authenticator::Principal;
use crate::config::OAuthConfig;
use crate::error::StoreError;
use crate::oauth2::client::{Client, ClientRegistry};
use crate::oauth2::error::{
    AuthorizeError, OAuthError, OAuthErrorKind, ResponseMode, build_redirect,
};
use crate::oauth2::generate_token;
use crate::oauth2::grants::{
    AssertionGrant, AssertionValidator, AuthorizationCodeGrant, ClientCredentialsGrant,
    GrantHandler, GrantType, PasswordGrant, RefreshTokenGrant, TokenRequest,
};
use crate::oauth2::password::PasswordGrantDelegate;
use crate::oauth2::pkce::CodeChallengeMethod;
use crate::oauth2::store::{AccessData, AuthorizeData, TokenStore};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Code,
    Token,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "code" => Some(ResponseType::Code),
            "token" => Some(ResponseType::Token),
            _ => None,
        }
    }

    fn mode(&self) -> ResponseMode {
        match self {
            ResponseType::Code => ResponseMode::Query,
            ResponseType::Token => ResponseMode::Fragment,
        }
    }
}

/// Authorization endpoint parameters, from the query string or a form body.
#[derive(Clone, Debug, Default, Deserialize, Serialize, ToSchema)]
pub struct AuthorizeRequest {
    /// Client identifier issued during registration
    pub client_id: Option<String>,
    /// Must exactly match a registered redirect URI
    pub redirect_uri: Option<String>,
    /// `code` or `token`
    pub response_type: Option<String>,
    /// Space-separated list of requested scopes
    pub scope: Option<String>,
    /// Opaque value returned unchanged to the client
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    /// `S256` or `plain` (default)
    pub code_challenge_method: Option<String>,
}

/// An authorize request whose client and redirect URI have been verified.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedAuthorize {
    pub client: Client,
    pub redirect_uri: String,
    pub response_type: ResponseType,
    pub scope: String,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
}

impl ValidatedAuthorize {
    /// Deliver `error` through the now trusted redirect URI.
    pub fn redirect_error(&self, error: OAuthError) -> AuthorizeError {
        AuthorizeError::Redirect {
            error,
            redirect_uri: self.redirect_uri.clone(),
            state: self.state.clone(),
            mode: self.response_type.mode(),
        }
    }
}

/// Successful token endpoint response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// RFC 8414 authorization server metadata.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub revocation_endpoint: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

pub struct AuthorizationServer {
    policy: OAuthConfig,
    clients: Arc<dyn ClientRegistry>,
    store: Arc<dyn TokenStore>,
    grants: HashMap<GrantType, Arc<dyn GrantHandler>>,
}

impl AuthorizationServer {
    /// Grants needing only the store are registered here when allowed by
    /// policy. Delegated grants are added with the `with_*` methods.
    pub fn new(
        policy: OAuthConfig,
        clients: Arc<dyn ClientRegistry>,
        store: Arc<dyn TokenStore>,
    ) -> Self {
        let revoke_rotated = policy.revoke_rotated_refresh_tokens;
        let mut server = Self {
            policy,
            clients,
            store: store.clone(),
            grants: HashMap::new(),
        };
        server.register(
            GrantType::AuthorizationCode,
            Arc::new(AuthorizationCodeGrant::new(store.clone())),
        );
        server.register(
            GrantType::RefreshToken,
            Arc::new(RefreshTokenGrant::new(store, revoke_rotated)),
        );
        server.register(
            GrantType::ClientCredentials,
            Arc::new(ClientCredentialsGrant),
        );
        server
    }

    pub fn with_password_delegate(mut self, delegate: Arc<dyn PasswordGrantDelegate>) -> Self {
        self.register(GrantType::Password, Arc::new(PasswordGrant::new(delegate)));
        self
    }

    pub fn with_assertion_validator(mut self, validator: Arc<dyn AssertionValidator>) -> Self {
        self.register(
            GrantType::Assertion,
            Arc::new(AssertionGrant::new(validator)),
        );
        self
    }

    fn register(&mut self, grant_type: GrantType, handler: Arc<dyn GrantHandler>) {
        if self.policy.allowed_grant_types.contains(&grant_type) {
            self.grants.insert(grant_type, handler);
        }
    }

    pub fn policy(&self) -> &OAuthConfig {
        &self.policy
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    /// Status used for the default `400` error responses.
    pub fn error_status(&self) -> StatusCode {
        StatusCode::from_u16(self.policy.error_status_code).unwrap_or(StatusCode::BAD_REQUEST)
    }

    pub fn supports_grant(&self, grant_type: GrantType) -> bool {
        self.grants.contains_key(&grant_type)
    }

    #[tracing::instrument(skip(self, request), fields(client_id = ?request.client_id))]
    pub async fn validate_authorize(
        &self,
        request: &AuthorizeRequest,
    ) -> Result<ValidatedAuthorize, AuthorizeError> {
        let client_id = request
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AuthorizeError::Local(
                    OAuthError::new(OAuthErrorKind::InvalidClient)
                        .with_description("client_id is required"),
                )
            })?;

        let client = match self.clients.get_client(client_id).await {
            Ok(client) => client,
            Err(StoreError::NotFound) => {
                return Err(AuthorizeError::Local(
                    OAuthError::new(OAuthErrorKind::InvalidClient)
                        .with_description("Unknown client"),
                ));
            }
            Err(e) => {
                tracing::error!("Client lookup failed: {}", e);
                return Err(AuthorizeError::Local(OAuthError::server_error()));
            }
        };

        let redirect_uri = client
            .resolve_redirect_uri(request.redirect_uri.as_deref())
            .ok_or_else(|| {
                tracing::warn!(client_id = %client.id, "Unregistered redirect_uri");
                AuthorizeError::Local(OAuthError::invalid_request(
                    "redirect_uri does not match a registered redirect URI",
                ))
            })?;

        let state = request.state.clone().filter(|s| !s.is_empty());
        let response_type = request
            .response_type
            .as_deref()
            .and_then(ResponseType::parse)
            .filter(|rt| self.policy.allowed_response_types.contains(rt));
        let Some(response_type) = response_type else {
            return Err(AuthorizeError::Redirect {
                error: OAuthError::new(OAuthErrorKind::UnsupportedResponseType),
                redirect_uri,
                state,
                mode: ResponseMode::Query,
            });
        };

        let mut validated = ValidatedAuthorize {
            client,
            redirect_uri,
            response_type,
            scope: request.scope.clone().unwrap_or_default(),
            state,
            code_challenge: None,
            code_challenge_method: None,
        };

        if response_type == ResponseType::Code {
            if !validated
                .client
                .is_grant_type_allowed(GrantType::AuthorizationCode)
            {
                return Err(
                    validated.redirect_error(OAuthError::new(OAuthErrorKind::UnauthorizedClient))
                );
            }
            self.validate_pkce(request, &mut validated)?;
        }

        Ok(validated)
    }

    fn validate_pkce(
        &self,
        request: &AuthorizeRequest,
        validated: &mut ValidatedAuthorize,
    ) -> Result<(), AuthorizeError> {
        let challenge = request.code_challenge.as_deref().filter(|c| !c.is_empty());
        let method = request
            .code_challenge_method
            .as_deref()
            .filter(|m| !m.is_empty());

        let Some(challenge) = challenge else {
            if method.is_some() {
                return Err(validated.redirect_error(OAuthError::invalid_request(
                    "code_challenge_method given without code_challenge",
                )));
            }
            if self.policy.require_pkce {
                return Err(validated
                    .redirect_error(OAuthError::invalid_request("code_challenge is required")));
            }
            return Ok(());
        };

        let method = match method {
            None => CodeChallengeMethod::Plain,
            Some(m) => m.parse().map_err(|_| {
                validated.redirect_error(OAuthError::invalid_request(
                    "Unsupported code_challenge_method",
                ))
            })?,
        };
        if method == CodeChallengeMethod::Plain && !self.policy.allow_plain_pkce {
            return Err(validated.redirect_error(OAuthError::invalid_request(
                "code_challenge_method=plain is not allowed",
            )));
        }

        validated.code_challenge = Some(challenge.to_string());
        validated.code_challenge_method = Some(method);
        Ok(())
    }

    /// Issue a code or an implicit access token for `principal` and return
    /// the redirect location.
    #[tracing::instrument(skip_all, fields(client_id = %request.client.id, user = %principal.name))]
    pub async fn issue(
        &self,
        request: &ValidatedAuthorize,
        principal: &Principal,
    ) -> Result<String, AuthorizeError> {
        let now = OffsetDateTime::now_utc();
        let mut params: Vec<(&str, String)> = Vec::new();

        match request.response_type {
            ResponseType::Code => {
                let code = generate_token()
                    .map_err(|e| request.redirect_error(OAuthError::from(e)))?;
                let data = AuthorizeData {
                    code: code.clone(),
                    client_id: request.client.id.clone(),
                    scope: request.scope.clone(),
                    redirect_uri: request.redirect_uri.clone(),
                    state: request.state.clone(),
                    created_at: now,
                    expires_in: self.policy.authorize_token_max_age_seconds,
                    code_challenge: request.code_challenge.clone(),
                    code_challenge_method: request.code_challenge_method,
                    user_data: principal.clone(),
                };
                self.store.create_authorize_data(data).await.map_err(|e| {
                    tracing::error!("Failed to store authorization code: {}", e);
                    request.redirect_error(OAuthError::server_error())
                })?;
                tracing::info!("Issued authorization code");
                params.push(("code", code));
            }
            ResponseType::Token => {
                let access_token = generate_token()
                    .map_err(|e| request.redirect_error(OAuthError::from(e)))?;
                let expires_in = self.policy.access_token_max_age_seconds;
                let data = AccessData {
                    access_token: access_token.clone(),
                    refresh_token: None,
                    client_id: request.client.id.clone(),
                    authorize_code: None,
                    previous_access_token: None,
                    scope: request.scope.clone(),
                    redirect_uri: Some(request.redirect_uri.clone()),
                    created_at: now,
                    expires_in,
                    user_data: Some(principal.clone()),
                };
                self.store.create_access_data(data).await.map_err(|e| {
                    tracing::error!("Failed to store access token: {}", e);
                    request.redirect_error(OAuthError::server_error())
                })?;
                tracing::info!("Issued implicit access token");
                params.push(("access_token", access_token));
                params.push(("token_type", "Bearer".to_string()));
                params.push(("expires_in", expires_in.to_string()));
                if !request.scope.is_empty() {
                    params.push(("scope", request.scope.clone()));
                }
            }
        }
        if let Some(state) = &request.state {
            params.push(("state", state.clone()));
        }

        build_redirect(&request.redirect_uri, request.response_type.mode(), &params)
            .ok_or_else(|| AuthorizeError::Local(OAuthError::server_error()))
    }

    /// Look up a client and check its secret in constant time.
    pub async fn authenticate_client(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
    ) -> Result<Client, OAuthError> {
        let Some(client_id) = client_id.filter(|id| !id.is_empty()) else {
            return Err(OAuthError::invalid_client());
        };
        let client = match self.clients.get_client(client_id).await {
            Ok(client) => client,
            Err(StoreError::NotFound) => {
                tracing::warn!(client_id, "Client authentication failed: unknown client");
                return Err(OAuthError::invalid_client());
            }
            Err(e) => {
                tracing::error!("Client lookup failed: {}", e);
                return Err(OAuthError::server_error());
            }
        };
        if !client.validate_secret(client_secret) {
            tracing::warn!(client_id, "Client authentication failed: bad secret");
            return Err(OAuthError::invalid_client());
        }
        Ok(client)
    }

    /// Dispatch a token request to the handler for its grant type.
    #[tracing::instrument(skip_all, fields(grant_type = %request.grant_type))]
    pub async fn token(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        request: &TokenRequest,
    ) -> Result<TokenResponse, OAuthError> {
        if request.grant_type.is_empty() {
            return Err(OAuthError::invalid_request("grant_type is required"));
        }
        let grant_type: GrantType = request.grant_type.parse()?;
        let handler = self
            .grants
            .get(&grant_type)
            .ok_or_else(|| OAuthError::new(OAuthErrorKind::UnsupportedGrantType))?;

        let client = self.authenticate_client(client_id, client_secret).await?;
        if !client.is_grant_type_allowed(grant_type) {
            return Err(OAuthError::new(OAuthErrorKind::UnauthorizedClient));
        }

        let outcome = handler.grant(&client, request).await?;

        let access_token = generate_token()?;
        let refresh_token = if self.policy.issue_refresh_tokens && outcome.refresh_allowed {
            Some(generate_token()?)
        } else {
            None
        };
        let expires_in = self.policy.access_token_max_age_seconds;
        let data = AccessData {
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
            client_id: client.id.clone(),
            authorize_code: outcome.authorize_code,
            previous_access_token: outcome.previous_access_token,
            scope: outcome.scope.clone(),
            redirect_uri: outcome.redirect_uri,
            created_at: OffsetDateTime::now_utc(),
            expires_in,
            user_data: outcome.user_data,
        };
        let user = data.user_data.as_ref().map(|p| p.name.clone());
        self.store.create_access_data(data).await.map_err(|e| {
            tracing::error!("Failed to store access token: {}", e);
            OAuthError::server_error()
        })?;
        tracing::info!(client_id = %client.id, user = ?user, "Issued access token");

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in,
            refresh_token,
            scope: Some(outcome.scope).filter(|s| !s.is_empty()),
        })
    }

    /// Revoke an access or refresh token owned by the authenticated client.
    ///
    /// Unknown tokens are not an error.
    #[tracing::instrument(skip_all)]
    pub async fn revoke(
        &self,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        token: &str,
        token_type_hint: Option<&str>,
    ) -> Result<(), OAuthError> {
        let client = self.authenticate_client(client_id, client_secret).await?;

        if token_type_hint == Some("refresh_token") {
            if !self.revoke_refresh(&client, token).await? {
                self.revoke_access(&client, token).await?;
            }
        } else if !self.revoke_access(&client, token).await? {
            self.revoke_refresh(&client, token).await?;
        }
        Ok(())
    }

    async fn revoke_access(&self, client: &Client, token: &str) -> Result<bool, OAuthError> {
        match self.store.load_access_data(token).await {
            Ok(data) if data.client_id == client.id => {
                self.store
                    .remove_access_data(token)
                    .await
                    .map_err(revoke_failure)?;
                if let Some(refresh) = &data.refresh_token {
                    self.store
                        .remove_refresh_token(refresh)
                        .await
                        .map_err(revoke_failure)?;
                }
                tracing::info!(client_id = %client.id, "Revoked access token");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.is_credential_failure() => Ok(false),
            Err(e) => Err(revoke_failure(e)),
        }
    }

    async fn revoke_refresh(&self, client: &Client, token: &str) -> Result<bool, OAuthError> {
        match self.store.load_refresh(token).await {
            Ok(data) if data.client_id == client.id => {
                self.store
                    .remove_refresh_token(token)
                    .await
                    .map_err(revoke_failure)?;
                self.store
                    .remove_access_data(&data.access_token)
                    .await
                    .map_err(revoke_failure)?;
                tracing::info!(client_id = %client.id, "Revoked refresh token");
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.is_credential_failure() => Ok(false),
            Err(e) => Err(revoke_failure(e)),
        }
    }

    pub fn metadata(&self, issuer: &str) -> ServerMetadata {
        let issuer = issuer.trim_end_matches('/');
        let mut grant_types: Vec<String> = self
            .policy
            .allowed_grant_types
            .iter()
            .filter(|g| self.grants.contains_key(g))
            .map(|g| g.as_str().to_string())
            .collect();
        if self
            .policy
            .allowed_response_types
            .contains(&ResponseType::Token)
        {
            grant_types.push("implicit".to_string());
        }
        let mut pkce_methods = vec![CodeChallengeMethod::S256.as_str().to_string()];
        if self.policy.allow_plain_pkce {
            pkce_methods.push(CodeChallengeMethod::Plain.as_str().to_string());
        }

        ServerMetadata {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            response_types_supported: self
                .policy
                .allowed_response_types
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
            grant_types_supported: grant_types,
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
                "none".to_string(),
            ],
            code_challenge_methods_supported: pkce_methods,
        }
    }
}

fn revoke_failure(e: StoreError) -> OAuthError {
    tracing::error!("Token store failure during revocation: {}", e);
    OAuthError::server_error()
}
