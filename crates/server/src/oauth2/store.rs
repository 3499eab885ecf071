//! Token store contract and an in-memory implementation.
//!
//! Authorization codes and access/refresh tokens are created and destroyed
//! only by the authorization server, through [`TokenStore`]. The code
//! exchange path relies on [`TokenStore::take_authorize_data`] being a single
//! atomic load-and-remove: of two concurrent exchanges of the same code,
//! exactly one may observe the data.

use crate::authenticator::Principal;
use crate::error::StoreError;
use crate::oauth2::pkce::CodeChallengeMethod;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

/// An issued authorization code.
#[derive(Clone, Debug, PartialEq)]
pub struct AuthorizeData {
    pub code: String,
    pub client_id: String,
    pub scope: String,
    /// Redirect URI as presented at authorize time
    pub redirect_uri: String,
    pub state: Option<String>,
    pub created_at: OffsetDateTime,
    /// Lifetime in seconds
    pub expires_in: i64,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<CodeChallengeMethod>,
    pub user_data: Principal,
}

impl AuthorizeData {
    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at
            .saturating_add(Duration::seconds(self.expires_in))
    }

    /// Expired once `now >= created_at + expires_in`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }
}

/// An issued access token with its optional refresh token.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub client_id: String,
    /// Code this token was exchanged for, if any
    pub authorize_code: Option<String>,
    /// Access token this one replaced through a refresh, if any
    pub previous_access_token: Option<String>,
    pub scope: String,
    pub redirect_uri: Option<String>,
    pub created_at: OffsetDateTime,
    /// Lifetime in seconds
    pub expires_in: i64,
    /// Absent for tokens issued to a client acting on its own behalf
    pub user_data: Option<Principal>,
}

impl AccessData {
    pub fn expires_at(&self) -> OffsetDateTime {
        self.created_at
            .saturating_add(Duration::seconds(self.expires_in))
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Seconds of validity left at `now`, never negative.
    pub fn remaining_seconds(&self, now: OffsetDateTime) -> i64 {
        (self.expires_at() - now).whole_seconds().max(0)
    }
}

/// Persistence contract for authorization codes and tokens.
///
/// Every method is a single call against the backend so a cancelled request
/// never leaves half-written state behind.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Fails with `Conflict` if the code already exists.
    async fn create_authorize_data(&self, data: AuthorizeData) -> Result<(), StoreError>;

    /// Returns `NotFound` or `Expired` for unusable codes.
    async fn load_authorize_data(&self, code: &str) -> Result<AuthorizeData, StoreError>;

    async fn remove_authorize_data(&self, code: &str) -> Result<(), StoreError>;

    /// Atomically load and remove a code. The code is gone afterwards even
    /// when `Expired` is returned.
    async fn take_authorize_data(&self, code: &str) -> Result<AuthorizeData, StoreError>;

    /// Stores the access token and, when present, indexes its refresh token.
    async fn create_access_data(&self, data: AccessData) -> Result<(), StoreError>;

    /// Returns `NotFound` or `Expired` for unusable tokens.
    async fn load_access_data(&self, token: &str) -> Result<AccessData, StoreError>;

    async fn remove_access_data(&self, token: &str) -> Result<(), StoreError>;

    /// Load the access data a refresh token was issued with.
    async fn load_refresh(&self, token: &str) -> Result<AccessData, StoreError>;

    async fn remove_refresh_token(&self, token: &str) -> Result<(), StoreError>;

    /// Atomically load and remove a refresh token.
    async fn take_refresh_token(&self, token: &str) -> Result<AccessData, StoreError>;
}

/// Token store backed by concurrent in-process maps.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    authorize: Arc<DashMap<String, AuthorizeData>>,
    access: Arc<DashMap<String, AccessData>>,
    refresh: Arc<DashMap<String, AccessData>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired codes and access tokens. Refresh tokens outlive the
    /// access token they were issued with and are kept.
    pub fn purge_expired(&self, now: OffsetDateTime) -> usize {
        let before = self.authorize.len() + self.access.len();
        self.authorize.retain(|_, data| !data.is_expired_at(now));
        self.access.retain(|_, data| !data.is_expired_at(now));
        before.saturating_sub(self.authorize.len() + self.access.len())
    }

    pub fn authorize_count(&self) -> usize {
        self.authorize.len()
    }

    pub fn access_count(&self) -> usize {
        self.access.len()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn create_authorize_data(&self, data: AuthorizeData) -> Result<(), StoreError> {
        match self.authorize.entry(data.code.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(data);
                Ok(())
            }
        }
    }

    async fn load_authorize_data(&self, code: &str) -> Result<AuthorizeData, StoreError> {
        let data = self
            .authorize
            .get(code)
            .map(|d| d.value().clone())
            .ok_or(StoreError::NotFound)?;
        if data.is_expired() {
            return Err(StoreError::Expired);
        }
        Ok(data)
    }

    async fn remove_authorize_data(&self, code: &str) -> Result<(), StoreError> {
        self.authorize.remove(code);
        Ok(())
    }

    async fn take_authorize_data(&self, code: &str) -> Result<AuthorizeData, StoreError> {
        let (_, data) = self.authorize.remove(code).ok_or(StoreError::NotFound)?;
        if data.is_expired() {
            return Err(StoreError::Expired);
        }
        Ok(data)
    }

    async fn create_access_data(&self, data: AccessData) -> Result<(), StoreError> {
        if let Some(refresh) = &data.refresh_token {
            match self.refresh.entry(refresh.clone()) {
                Entry::Occupied(_) => return Err(StoreError::Conflict),
                Entry::Vacant(slot) => {
                    slot.insert(data.clone());
                }
            }
        }
        match self.access.entry(data.access_token.clone()) {
            Entry::Occupied(_) => {
                if let Some(refresh) = &data.refresh_token {
                    self.refresh.remove(refresh);
                }
                Err(StoreError::Conflict)
            }
            Entry::Vacant(slot) => {
                slot.insert(data);
                Ok(())
            }
        }
    }

    async fn load_access_data(&self, token: &str) -> Result<AccessData, StoreError> {
        let data = self
            .access
            .get(token)
            .map(|d| d.value().clone())
            .ok_or(StoreError::NotFound)?;
        if data.is_expired() {
            return Err(StoreError::Expired);
        }
        Ok(data)
    }

    async fn remove_access_data(&self, token: &str) -> Result<(), StoreError> {
        self.access.remove(token);
        Ok(())
    }

    async fn load_refresh(&self, token: &str) -> Result<AccessData, StoreError> {
        self.refresh
            .get(token)
            .map(|d| d.value().clone())
            .ok_or(StoreError::NotFound)
    }

    async fn remove_refresh_token(&self, token: &str) -> Result<(), StoreError> {
        self.refresh.remove(token);
        Ok(())
    }

    async fn take_refresh_token(&self, token: &str) -> Result<AccessData, StoreError> {
        self.refresh
            .remove(token)
            .map(|(_, data)| data)
            .ok_or(StoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal() -> Principal {
        Principal::new("bob", "idp:bob")
    }

    fn authorize_data(code: &str, created_at: OffsetDateTime, expires_in: i64) -> AuthorizeData {
        AuthorizeData {
            code: code.to_string(),
            client_id: "A".into(),
            scope: "user:info".into(),
            redirect_uri: "https://a.example/cb".into(),
            state: Some("xyz".into()),
            created_at,
            expires_in,
            code_challenge: None,
            code_challenge_method: None,
            user_data: principal(),
        }
    }

    fn access_data(token: &str, refresh: Option<&str>) -> AccessData {
        AccessData {
            access_token: token.to_string(),
            refresh_token: refresh.map(String::from),
            client_id: "A".into(),
            authorize_code: None,
            previous_access_token: None,
            scope: "user:info".into(),
            redirect_uri: None,
            created_at: OffsetDateTime::now_utc(),
            expires_in: 3600,
            user_data: Some(principal()),
        }
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let created = OffsetDateTime::now_utc();
        let data = authorize_data("c", created, 60);
        assert!(!data.is_expired_at(created + Duration::seconds(59)));
        assert!(data.is_expired_at(created + Duration::seconds(60)));
        assert!(data.is_expired_at(created + Duration::seconds(61)));
    }

    #[test]
    fn access_expiry_boundary_is_inclusive() {
        let created = OffsetDateTime::now_utc();
        let data = AccessData {
            created_at: created,
            expires_in: 60,
            ..access_data("t", None)
        };
        assert!(!data.is_expired_at(created + Duration::seconds(59)));
        assert_eq!(data.remaining_seconds(created + Duration::seconds(59)), 1);
        assert!(data.is_expired_at(created + Duration::seconds(60)));
        assert_eq!(data.remaining_seconds(created + Duration::seconds(61)), 0);
    }

    #[test]
    fn huge_lifetime_saturates() {
        let data = AccessData {
            expires_in: i64::MAX,
            ..access_data("t", None)
        };
        assert!(!data.is_expired());
        assert!(!authorize_data("c", OffsetDateTime::now_utc(), i64::MAX).is_expired());
    }

    #[tokio::test]
    async fn expired_access_token_is_rejected() {
        let store = MemoryTokenStore::new();
        store
            .create_access_data(AccessData {
                created_at: OffsetDateTime::now_utc() - Duration::seconds(600),
                expires_in: 300,
                ..access_data("stale", Some("stale-refresh"))
            })
            .await
            .unwrap();

        assert_eq!(
            store.load_access_data("stale").await,
            Err(StoreError::Expired)
        );
    }

    #[tokio::test]
    async fn take_is_single_use() {
        let store = MemoryTokenStore::new();
        store
            .create_authorize_data(authorize_data("code-1", OffsetDateTime::now_utc(), 300))
            .await
            .unwrap();

        assert!(store.take_authorize_data("code-1").await.is_ok());
        assert_eq!(
            store.take_authorize_data("code-1").await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn concurrent_takes_have_one_winner() {
        let store = MemoryTokenStore::new();
        store
            .create_authorize_data(authorize_data("race", OffsetDateTime::now_utc(), 300))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.take_authorize_data("race").await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_code_is_rejected_and_consumed() {
        let store = MemoryTokenStore::new();
        let past = OffsetDateTime::now_utc() - Duration::seconds(600);
        store
            .create_authorize_data(authorize_data("old", past, 300))
            .await
            .unwrap();

        assert_eq!(
            store.load_authorize_data("old").await,
            Err(StoreError::Expired)
        );
        assert_eq!(
            store.take_authorize_data("old").await,
            Err(StoreError::Expired)
        );
        assert_eq!(store.authorize_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_code_conflicts() {
        let store = MemoryTokenStore::new();
        let now = OffsetDateTime::now_utc();
        store
            .create_authorize_data(authorize_data("dup", now, 300))
            .await
            .unwrap();
        assert_eq!(
            store
                .create_authorize_data(authorize_data("dup", now, 300))
                .await,
            Err(StoreError::Conflict)
        );
    }

    #[tokio::test]
    async fn refresh_index_survives_access_removal() {
        let store = MemoryTokenStore::new();
        store
            .create_access_data(access_data("at-1", Some("rt-1")))
            .await
            .unwrap();

        store.remove_access_data("at-1").await.unwrap();
        assert_eq!(
            store.load_access_data("at-1").await,
            Err(StoreError::NotFound)
        );
        assert_eq!(store.load_refresh("rt-1").await.unwrap().access_token, "at-1");

        assert!(store.take_refresh_token("rt-1").await.is_ok());
        assert_eq!(
            store.take_refresh_token("rt-1").await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn purge_drops_expired_entries() {
        let store = MemoryTokenStore::new();
        let past = OffsetDateTime::now_utc() - Duration::seconds(600);
        store
            .create_authorize_data(authorize_data("old", past, 60))
            .await
            .unwrap();
        store
            .create_authorize_data(authorize_data("new", OffsetDateTime::now_utc(), 60))
            .await
            .unwrap();
        let mut stale = access_data("at-old", None);
        stale.created_at = past;
        store.create_access_data(stale).await.unwrap();

        assert_eq!(store.purge_expired(OffsetDateTime::now_utc()), 2);
        assert_eq!(store.authorize_count(), 1);
        assert_eq!(store.access_count(), 0);
    }
}
