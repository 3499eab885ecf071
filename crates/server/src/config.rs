use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;

use crate::oauth2::grants::GrantType;
use crate::oauth2::server::ResponseType;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Public base URL of this server, used in the metadata document.
    pub issuer_url: String,
    #[serde(default)]
    pub oauth: OAuthConfig,
    pub session: SessionConfig,
    #[serde(default)]
    pub csrf: CsrfConfig,
    /// Upstream credential source backing the password grant and the login form.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
    /// Seed entries for the in-memory client registry.
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// Authorization server policy.
#[derive(Clone, Debug, Deserialize)]
pub struct OAuthConfig {
    #[serde(default = "default_authorize_max_age")]
    pub authorize_token_max_age_seconds: i64,
    #[serde(default = "default_access_max_age")]
    pub access_token_max_age_seconds: i64,
    #[serde(default = "default_response_types")]
    pub allowed_response_types: Vec<ResponseType>,
    #[serde(default = "default_grant_types")]
    pub allowed_grant_types: Vec<GrantType>,
    #[serde(default = "default_true")]
    pub issue_refresh_tokens: bool,
    /// When set, a refresh token stops working once it has been exchanged.
    #[serde(default = "default_true")]
    pub revoke_rotated_refresh_tokens: bool,
    #[serde(default)]
    pub require_pkce: bool,
    #[serde(default = "default_true")]
    pub allow_plain_pkce: bool,
    #[serde(default = "default_true")]
    pub invalidate_session_after_authorize: bool,
    #[serde(default = "default_error_status")]
    pub error_status_code: u16,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            authorize_token_max_age_seconds: default_authorize_max_age(),
            access_token_max_age_seconds: default_access_max_age(),
            allowed_response_types: default_response_types(),
            allowed_grant_types: default_grant_types(),
            issue_refresh_tokens: true,
            revoke_rotated_refresh_tokens: true,
            require_pkce: false,
            allow_plain_pkce: true,
            invalidate_session_after_authorize: true,
            error_status_code: default_error_status(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,
    /// Signing secrets. The first entry signs new cookies, all entries verify.
    pub secrets: Vec<String>,
    #[serde(default = "default_session_max_age")]
    pub max_age_seconds: i64,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default)]
    pub same_site: SameSite,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(format!("Unknown SameSite policy: {other}")),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CsrfConfig {
    #[serde(default = "default_csrf_cookie")]
    pub cookie_name: String,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_csrf_cookie(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    pub token_url: String,
    pub userinfo_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(default)]
    pub secret: Option<String>,
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub grant_types: Vec<GrantType>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_authorize_max_age() -> i64 {
    300 // 5 minutes
}

fn default_access_max_age() -> i64 {
    86400 // 24 hours
}

fn default_response_types() -> Vec<ResponseType> {
    vec![ResponseType::Code, ResponseType::Token]
}

fn default_grant_types() -> Vec<GrantType> {
    vec![
        GrantType::AuthorizationCode,
        GrantType::RefreshToken,
        GrantType::Password,
        GrantType::ClientCredentials,
        GrantType::Assertion,
    ]
}

fn default_true() -> bool {
    true
}

fn default_error_status() -> u16 {
    400
}

fn default_session_cookie() -> String {
    "ssn".to_string()
}

fn default_session_max_age() -> i64 {
    300
}

fn default_csrf_cookie() -> String {
    "csrf".to_string()
}

fn default_provider_name() -> String {
    "upstream".to_string()
}

fn default_upstream_timeout() -> u64 {
    10
}

/// Minimum length of a session signing secret in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Upper bound for any configured lifetime: ten years in seconds.
pub const MAX_LIFETIME_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

impl AppConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.secrets.is_empty() {
            return Err(ConfigError::Validation(
                "session.secrets must contain at least one secret".into(),
            ));
        }
        if self
            .session
            .secrets
            .iter()
            .any(|s| s.len() < MIN_SECRET_LEN)
        {
            return Err(ConfigError::Validation(format!(
                "session.secrets entries must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if !(1..=MAX_LIFETIME_SECONDS).contains(&self.session.max_age_seconds) {
            return Err(ConfigError::Validation(format!(
                "session.max_age_seconds must be between 1 and {MAX_LIFETIME_SECONDS}"
            )));
        }
        if self.session.same_site == SameSite::None && !self.session.secure {
            return Err(ConfigError::Validation(
                "session.same_site=none requires session.secure=true".into(),
            ));
        }
        let lifetimes = [
            self.oauth.authorize_token_max_age_seconds,
            self.oauth.access_token_max_age_seconds,
        ];
        if lifetimes
            .iter()
            .any(|age| !(1..=MAX_LIFETIME_SECONDS).contains(age))
        {
            return Err(ConfigError::Validation(format!(
                "oauth token max ages must be between 1 and {MAX_LIFETIME_SECONDS}"
            )));
        }
        if !(400..=499).contains(&self.oauth.error_status_code) {
            return Err(ConfigError::Validation(
                "oauth.error_status_code must be a 4xx status".into(),
            ));
        }
        Ok(())
    }
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `SESSION__MAX_AGE_SECONDS`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    let cfg = Config::builder()
        .add_source(File::with_name("config.yaml"))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

/// Convenience helper for binaries wanting panic-on-error behaviour.
pub fn load_config_or_panic() -> AppConfig {
    match load_config() {
        Ok(c) => c,
        Err(e) => panic!("Failed to load configuration: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config")
    }

    const MINIMAL: &str = r#"
issuer_url: "https://oauth.example.com"
session:
  secrets: ["0123456789abcdef0123456789abcdef"]
"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.oauth.authorize_token_max_age_seconds, 300);
        assert_eq!(cfg.oauth.access_token_max_age_seconds, 86400);
        assert!(cfg.oauth.revoke_rotated_refresh_tokens);
        assert_eq!(cfg.session.cookie_name, "ssn");
        assert_eq!(cfg.session.same_site, SameSite::Lax);
        assert_eq!(cfg.csrf.cookie_name, "csrf");
        assert!(cfg.upstream.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.session.secrets = vec!["short".into()];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn same_site_none_requires_secure() {
        let mut cfg = parse(MINIMAL);
        cfg.session.same_site = SameSite::None;
        cfg.session.secure = false;
        assert!(cfg.validate().is_err());
        cfg.session.secure = true;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn error_status_must_be_client_error() {
        let mut cfg = parse(MINIMAL);
        cfg.oauth.error_status_code = 500;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn lifetimes_must_be_bounded() {
        let mut cfg = parse(MINIMAL);
        cfg.oauth.access_token_max_age_seconds = MAX_LIFETIME_SECONDS;
        assert!(cfg.validate().is_ok());

        cfg.oauth.access_token_max_age_seconds = i64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        let mut cfg = parse(MINIMAL);
        cfg.oauth.authorize_token_max_age_seconds = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.session.max_age_seconds = MAX_LIFETIME_SECONDS + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn same_site_parses_case_insensitively() {
        assert_eq!("Strict".parse::<SameSite>(), Ok(SameSite::Strict));
        assert_eq!("NONE".parse::<SameSite>(), Ok(SameSite::None));
        assert!("sideways".parse::<SameSite>().is_err());
    }
}
