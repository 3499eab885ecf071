//! Configuration parsing tests.

use auth_broker::config::{AppConfig, ConfigError, SameSite};
use auth_broker::oauth2::Client;
use auth_broker::oauth2::grants::GrantType;
use auth_broker::oauth2::server::ResponseType;
use config::{Config, File, FileFormat};

const FULL: &str = r#"
listen_addr: "127.0.0.1:9000"
issuer_url: "https://oauth.example.com"
oauth:
  authorize_token_max_age_seconds: 120
  access_token_max_age_seconds: 3600
  allowed_response_types: ["code"]
  allowed_grant_types: ["authorization_code", "refresh_token"]
  issue_refresh_tokens: true
  revoke_rotated_refresh_tokens: false
  require_pkce: true
  allow_plain_pkce: false
  invalidate_session_after_authorize: false
  error_status_code: 401
session:
  cookie_name: "broker_session"
  secrets:
    - "primary-secret-0123456789abcdef012345"
    - "previous-secret-0123456789abcdef01234"
  max_age_seconds: 600
  secure: true
  same_site: "strict"
csrf:
  cookie_name: "broker_csrf"
upstream:
  token_url: "https://idp.example.com/oauth/token"
  userinfo_url: "https://idp.example.com/userinfo"
  client_id: "broker"
  client_secret: "s3cret"
  provider_name: "idp"
  timeout_seconds: 3
clients:
  - id: "A"
    secret: "a-secret"
    redirect_uris: ["https://a.example/cb"]
  - id: "cli"
    redirect_uris: ["http://127.0.0.1:8400/callback", "http://[::1]:8400/callback"]
    grant_types: ["authorization_code"]
"#;

fn parse(yaml: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = Config::builder()
        .add_source(File::from_str(yaml, FileFormat::Yaml))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[test]
fn test_full_config() {
    let config = parse(FULL).expect("valid config");

    assert_eq!(config.listen_addr, "127.0.0.1:9000");
    assert_eq!(config.oauth.authorize_token_max_age_seconds, 120);
    assert_eq!(config.oauth.allowed_response_types, vec![ResponseType::Code]);
    assert_eq!(
        config.oauth.allowed_grant_types,
        vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
    );
    assert!(!config.oauth.revoke_rotated_refresh_tokens);
    assert!(config.oauth.require_pkce);
    assert_eq!(config.oauth.error_status_code, 401);

    assert_eq!(config.session.cookie_name, "broker_session");
    assert_eq!(config.session.secrets.len(), 2);
    assert_eq!(config.session.same_site, SameSite::Strict);
    assert_eq!(config.csrf.cookie_name, "broker_csrf");

    let upstream = config.upstream.as_ref().expect("upstream");
    assert_eq!(upstream.provider_name, "idp");
    assert_eq!(upstream.timeout_seconds, 3);

    let clients: Vec<Client> = config.clients.iter().cloned().map(Client::from).collect();
    assert_eq!(clients.len(), 2);
    assert!(!clients[0].is_public());
    assert!(clients[1].is_public());
    assert!(clients[1].is_grant_type_allowed(GrantType::AuthorizationCode));
    assert!(!clients[1].is_grant_type_allowed(GrantType::Password));
    assert!(clients[0].is_grant_type_allowed(GrantType::Password));
}

#[test]
fn test_missing_session_is_a_build_error() {
    let result = parse(r#"issuer_url: "https://oauth.example.com""#);
    assert!(matches!(result, Err(ConfigError::Build(_))));
}

#[test]
fn test_unknown_grant_type_is_rejected() {
    let yaml = r#"
issuer_url: "https://oauth.example.com"
oauth:
  allowed_grant_types: ["implicit_magic"]
session:
  secrets: ["0123456789abcdef0123456789abcdef"]
"#;
    assert!(matches!(parse(yaml), Err(ConfigError::Build(_))));
}

#[test]
fn test_validation_errors() {
    for yaml in [
        // no secrets
        r#"
issuer_url: "https://oauth.example.com"
session:
  secrets: []
"#,
        // short secret
        r#"
issuer_url: "https://oauth.example.com"
session:
  secrets: ["too-short"]
"#,
        // SameSite=None over plain HTTP
        r#"
issuer_url: "https://oauth.example.com"
session:
  secrets: ["0123456789abcdef0123456789abcdef"]
  secure: false
  same_site: "none"
"#,
        // non-positive TTL
        r#"
issuer_url: "https://oauth.example.com"
oauth:
  access_token_max_age_seconds: 0
session:
  secrets: ["0123456789abcdef0123456789abcdef"]
"#,
        // lifetime past any representable expiry
        r#"
issuer_url: "https://oauth.example.com"
session:
  secrets: ["0123456789abcdef0123456789abcdef"]
  max_age_seconds: 9223372036854775807
"#,
    ] {
        assert!(
            matches!(parse(yaml), Err(ConfigError::Validation(_))),
            "{yaml}"
        );
    }
}
