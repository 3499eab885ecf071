use auth_broker::AppResources;
use auth_broker::api::start_webserver;
use auth_broker::config::load_config_or_panic;
use auth_broker::oauth2::password::{PasswordGrantDelegate, UpstreamPasswordDelegate};
use auth_broker::oauth2::{Client, MemoryClientRegistry, MemoryTokenStore};
use color_eyre::eyre::eyre;
use rustls::crypto;
use rustls::crypto::CryptoProvider;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::time::{Duration, interval};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_tracing() {
    let default_directives = "auth_broker=info,tower_http=info,hyper=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    initialize_tracing();

    let config = load_config_or_panic();

    let ring_provider = crypto::ring::default_provider();
    CryptoProvider::install_default(ring_provider)
        .map_err(|_| eyre!("Failed to install crypto provider"))?;

    let clients = Arc::new(MemoryClientRegistry::from_clients(
        config.clients.iter().cloned().map(Client::from),
    ));
    tracing::info!(clients = clients.len(), "Client registry loaded");

    let store = Arc::new(MemoryTokenStore::new());

    // Expired codes and tokens are rejected on read; this only bounds memory.
    {
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let purged = store.purge_expired(OffsetDateTime::now_utc());
                if purged > 0 {
                    tracing::debug!(purged, "Purged expired grants");
                }
            }
        });
    }

    let password: Option<Arc<dyn PasswordGrantDelegate>> = match &config.upstream {
        Some(upstream) => {
            tracing::info!(
                provider = %upstream.provider_name,
                token_url = %upstream.token_url,
                "Using upstream credential source"
            );
            Some(Arc::new(UpstreamPasswordDelegate::new(upstream.clone())?))
        }
        None => {
            tracing::warn!("No upstream configured; login form and password grant are disabled");
            None
        }
    };

    let resources = AppResources::new(config, clients, store, password, None);
    start_webserver(resources).await
}
