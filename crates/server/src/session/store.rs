//! Signed cookie session store.
//!
//! Wire format: `v1.<payload>.<signature>` where `payload` is the session map
//! as base64url JSON and `signature` is base64url HMAC-SHA256 over
//! `v1.<payload>`. New cookies are signed with the first configured secret;
//! any configured secret verifies, so secrets can be rotated without logging
//! everybody out.

use crate::config::{SameSite, SessionConfig};
use axum::http::{HeaderMap, HeaderValue};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session signing secret configured")]
    NoSecret,
    #[error("Failed to encode session: {0}")]
    Encode(String),
}

/// A mutable string-keyed map read from one request's cookie.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Session {
    values: Map<String, Value>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Clone)]
pub struct SessionStore {
    cookie_name: String,
    secrets: Vec<Vec<u8>>,
    max_age_seconds: i64,
    secure: bool,
    same_site: SameSite,
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            cookie_name: config.cookie_name.clone(),
            secrets: config
                .secrets
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect(),
            max_age_seconds: config.max_age_seconds,
            secure: config.secure,
            same_site: config.same_site,
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn max_age_seconds(&self) -> i64 {
        self.max_age_seconds
    }

    /// Session from the configured cookie. Never fails: a missing, malformed
    /// or badly signed cookie yields an empty session.
    pub fn get(&self, headers: &HeaderMap) -> Session {
        self.get_named(headers, &self.cookie_name)
    }

    pub fn get_named(&self, headers: &HeaderMap, cookie_name: &str) -> Session {
        super::read_cookie(headers, cookie_name)
            .and_then(|value| self.decode(&value))
            .unwrap_or_default()
    }

    fn mac(&self, secret: &[u8]) -> Result<HmacSha256, SessionError> {
        HmacSha256::new_from_slice(secret).map_err(|e| SessionError::Encode(e.to_string()))
    }

    /// Serialize and sign with the primary secret.
    pub fn encode(&self, session: &Session) -> Result<String, SessionError> {
        let primary = self.secrets.first().ok_or(SessionError::NoSecret)?;
        let json =
            serde_json::to_vec(&session.values).map_err(|e| SessionError::Encode(e.to_string()))?;
        let signed = format!("{VERSION}.{}", URL_SAFE_NO_PAD.encode(json));
        let mut mac = self.mac(primary)?;
        mac.update(signed.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{signed}.{signature}"))
    }

    /// Verify against every configured secret and deserialize.
    pub fn decode(&self, value: &str) -> Option<Session> {
        let (signed, signature) = value.rsplit_once('.')?;
        let (version, payload) = signed.split_once('.')?;
        if version != VERSION {
            return None;
        }
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let verified = self.secrets.iter().any(|secret| {
            self.mac(secret).is_ok_and(|mut mac| {
                mac.update(signed.as_bytes());
                mac.verify_slice(&signature).is_ok()
            })
        });
        if !verified {
            tracing::debug!("Discarding session cookie with invalid signature");
            return None;
        }

        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let values: Map<String, Value> = serde_json::from_slice(&json).ok()?;
        Some(Session { values })
    }

    /// `Set-Cookie` header persisting `session`.
    pub fn set_cookie(&self, session: &Session) -> Result<HeaderValue, SessionError> {
        let value = self.encode(session)?;
        let cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite={}{}",
            self.cookie_name,
            value,
            self.max_age_seconds,
            self.same_site.as_str(),
            if self.secure { "; Secure" } else { "" }
        );
        HeaderValue::from_str(&cookie).map_err(|e| SessionError::Encode(e.to_string()))
    }
}
