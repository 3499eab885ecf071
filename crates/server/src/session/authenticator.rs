use crate::authenticator::{AuthenticationError, Principal, RequestAuthenticator};
use crate::session::store::{Session, SessionError, SessionStore};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use time::OffsetDateTime;

const NAME_KEY: &str = "user.name";
const UID_KEY: &str = "user.uid";
const EXPIRES_KEY: &str = "exp";

/// The principal fields of a session. `exp` is a unix timestamp in seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionUser {
    pub name: String,
    pub uid: String,
    pub exp: i64,
}

impl SessionUser {
    fn read(session: &Session) -> Option<Self> {
        Some(Self {
            exp: session.get_i64(EXPIRES_KEY)?,
            name: session.get_str(NAME_KEY)?.to_string(),
            uid: session.get_str(UID_KEY)?.to_string(),
        })
    }

    fn write(&self, session: &mut Session) {
        session.set(NAME_KEY, self.name.clone());
        session.set(UID_KEY, self.uid.clone());
        session.set(EXPIRES_KEY, self.exp);
    }
}

/// Authenticates requests from the session cookie and records logins and
/// logouts in it.
#[derive(Clone)]
pub struct SessionAuthenticator {
    store: Arc<SessionStore>,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Principal of a live session, or `None`. Malformed, expired and
    /// incomplete sessions are all simply unauthenticated.
    pub fn authenticate_at(&self, headers: &HeaderMap, now: OffsetDateTime) -> Option<Principal> {
        let session = self.store.get(headers);
        let exp = session.get_i64(EXPIRES_KEY)?;
        if now.unix_timestamp() >= exp {
            return None;
        }
        let user = SessionUser::read(&session)?;
        if user.name.is_empty() || user.uid.is_empty() {
            return None;
        }
        Some(Principal::new(user.name, user.uid))
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Option<Principal> {
        self.authenticate_at(headers, OffsetDateTime::now_utc())
    }

    /// Record a successful login. Returns the `Set-Cookie` header to send.
    pub fn authentication_succeeded(
        &self,
        headers: &HeaderMap,
        principal: &Principal,
    ) -> Result<HeaderValue, SessionError> {
        let mut session = self.store.get(headers);
        SessionUser {
            name: principal.name.clone(),
            uid: principal.uid.clone(),
            exp: OffsetDateTime::now_utc()
                .unix_timestamp()
                .saturating_add(self.store.max_age_seconds()),
        }
        .write(&mut session);
        self.store.set_cookie(&session)
    }

    /// Overwrite the session with an empty principal that is already expired.
    pub fn invalidate_authentication(
        &self,
        headers: &HeaderMap,
    ) -> Result<HeaderValue, SessionError> {
        let mut session = self.store.get(headers);
        SessionUser {
            name: String::new(),
            uid: String::new(),
            exp: 0,
        }
        .write(&mut session);
        self.store.set_cookie(&session)
    }
}

#[async_trait]
impl RequestAuthenticator for SessionAuthenticator {
    async fn authenticate_request(
        &self,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, AuthenticationError> {
        Ok(self.authenticate(headers))
    }
}
