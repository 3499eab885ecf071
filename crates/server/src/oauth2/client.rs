//! Registered OAuth2 clients.
//!
//! The registry is a read-only collaborator: clients are owned and persisted
//! elsewhere and the authorization server only looks them up.

use crate::config::ClientConfig;
use crate::error::StoreError;
use crate::oauth2::grants::GrantType;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// A registered OAuth2 client.
#[derive(Clone, Debug, PartialEq)]
pub struct Client {
    pub id: String,
    /// Client secret (None for public clients)
    pub secret: Option<String>,
    /// Allowed redirect URIs, compared exactly
    pub redirect_uris: Vec<String>,
    /// Grant types the client may use. Empty means every enabled grant.
    pub grant_types: Vec<GrantType>,
    /// Opaque data owned by the registry backend
    pub user_data: Option<serde_json::Value>,
}

impl Client {
    pub fn new(id: impl Into<String>, secret: Option<String>, redirect_uris: Vec<String>) -> Self {
        Self {
            id: id.into(),
            secret,
            redirect_uris,
            grant_types: Vec::new(),
            user_data: None,
        }
    }

    pub fn with_grant_types(mut self, grant_types: Vec<GrantType>) -> Self {
        self.grant_types = grant_types;
        self
    }

    pub fn is_public(&self) -> bool {
        self.secret.is_none()
    }

    /// Compare the presented secret against the registered one in constant time.
    ///
    /// Public clients have no secret and validate only an absent or empty secret.
    pub fn validate_secret(&self, presented: Option<&str>) -> bool {
        match (&self.secret, presented) {
            (Some(stored), Some(provided)) => stored.as_bytes().ct_eq(provided.as_bytes()).into(),
            (None, None) => true,
            (None, Some(provided)) => provided.is_empty(),
            (Some(_), None) => false,
        }
    }

    /// Resolve the redirect URI for an authorization request.
    ///
    /// A presented URI must exactly match a registered one. When none is
    /// presented the client must have exactly one registered URI.
    pub fn resolve_redirect_uri(&self, presented: Option<&str>) -> Option<String> {
        match presented {
            Some(uri) if !uri.is_empty() => self
                .redirect_uris
                .iter()
                .find(|registered| registered.as_str() == uri)
                .cloned(),
            _ if self.redirect_uris.len() == 1 => self.redirect_uris.first().cloned(),
            _ => None,
        }
    }

    pub fn is_grant_type_allowed(&self, grant_type: GrantType) -> bool {
        self.grant_types.is_empty() || self.grant_types.contains(&grant_type)
    }
}

impl From<ClientConfig> for Client {
    fn from(c: ClientConfig) -> Self {
        Client::new(c.id, c.secret, c.redirect_uris).with_grant_types(c.grant_types)
    }
}

/// Lookup of registered clients.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Returns `StoreError::NotFound` for unknown ids.
    async fn get_client(&self, id: &str) -> Result<Client, StoreError>;
}

/// Client registry held in memory, seeded from configuration.
#[derive(Clone, Default)]
pub struct MemoryClientRegistry {
    clients: Arc<DashMap<String, Client>>,
}

impl MemoryClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_clients(clients: impl IntoIterator<Item = Client>) -> Self {
        let registry = Self::new();
        for client in clients {
            registry.insert(client);
        }
        registry
    }

    pub fn insert(&self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[async_trait]
impl ClientRegistry for MemoryClientRegistry {
    async fn get_client(&self, id: &str) -> Result<Client, StoreError> {
        self.clients
            .get(id)
            .map(|c| c.value().clone())
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confidential() -> Client {
        Client::new(
            "A",
            Some("s3cret".into()),
            vec!["https://a.example/cb".into(), "https://a.example/alt".into()],
        )
    }

    #[test]
    fn secret_validation() {
        let client = confidential();
        assert!(client.validate_secret(Some("s3cret")));
        assert!(!client.validate_secret(Some("s3cre")));
        assert!(!client.validate_secret(Some("s3cret!")));
        assert!(!client.validate_secret(None));

        let public = Client::new("pub", None, vec![]);
        assert!(public.validate_secret(None));
        assert!(public.validate_secret(Some("")));
        assert!(!public.validate_secret(Some("anything")));
    }

    #[test]
    fn redirect_uri_must_match_exactly() {
        let client = confidential();
        assert_eq!(
            client.resolve_redirect_uri(Some("https://a.example/alt")),
            Some("https://a.example/alt".to_string())
        );
        assert_eq!(client.resolve_redirect_uri(Some("https://a.example/cb/")), None);
        assert_eq!(client.resolve_redirect_uri(Some("https://evil.example/cb")), None);
        // Ambiguous without an explicit URI
        assert_eq!(client.resolve_redirect_uri(None), None);

        let single = Client::new("B", None, vec!["https://b.example/cb".into()]);
        assert_eq!(
            single.resolve_redirect_uri(None),
            Some("https://b.example/cb".to_string())
        );
    }

    #[test]
    fn grant_type_restrictions() {
        let open = confidential();
        assert!(open.is_grant_type_allowed(GrantType::Password));

        let restricted = confidential().with_grant_types(vec![GrantType::AuthorizationCode]);
        assert!(restricted.is_grant_type_allowed(GrantType::AuthorizationCode));
        assert!(!restricted.is_grant_type_allowed(GrantType::ClientCredentials));
    }

    #[tokio::test]
    async fn memory_registry_lookup() {
        let registry = MemoryClientRegistry::from_clients([confidential()]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_client("A").await.unwrap().id, "A");
        assert_eq!(
            registry.get_client("missing").await,
            Err(StoreError::NotFound)
        );
    }
}
