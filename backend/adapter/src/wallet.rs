//! Wallet connector bootstrap.
//!
//! Extension injection is asynchronous and may race page load, so the
//! connector is discovered by polling the host environment at a fixed
//! interval under a short timeout. A found connector is then version-gated,
//! health-checked under a longer timeout, authorized, and asked for its
//! service endpoint configuration. The whole sequence is idempotent; a
//! failed bootstrap can simply be re-invoked.

use std::sync::Arc;

use tokio::time::{interval, timeout};
use tracing::{debug, info};

use crate::config::Config;
use crate::contract::{HostEnvironment, ServiceUriConfig, WalletConnector, WalletSession};
use crate::errors::ConnectorError;

/// A validated, authorized wallet session plus its advertised endpoints.
pub struct WalletBootstrap {
    pub connector: Arc<dyn WalletConnector>,
    pub session: Arc<dyn WalletSession>,
    pub uris: ServiceUriConfig,
}

impl std::fmt::Debug for WalletBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletBootstrap")
            .field("uris", &self.uris)
            .finish_non_exhaustive()
    }
}

/// Run the full discovery → version check → health check → authorize →
/// endpoint fetch sequence.
pub async fn bootstrap(
    env: &dyn HostEnvironment,
    cfg: &Config,
) -> Result<WalletBootstrap, ConnectorError> {
    let connector = discover(env, cfg).await?;

    let found = connector.api_version();
    if !version_matches(&cfg.required_api_version, &found) {
        return Err(ConnectorError::VersionMismatch {
            required: cfg.required_api_version.clone(),
            found,
        });
    }
    debug!("Connector found, API version {found}");

    // A connector that sits on the health check is distinct from one that
    // never appeared; give it a longer budget before declaring it dead.
    match timeout(cfg.connector_enable_timeout(), connector.is_enabled()).await {
        Err(_) => return Err(ConnectorError::Unresponsive),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(enabled)) => debug!("Connector health check passed (enabled: {enabled})"),
    }

    let session = connector.enable().await?;
    let wallet_state = session.state().await?;
    let uris = connector.service_uri_config().await?;
    info!(
        "Wallet authorized, coin pk {}.., indexer {}",
        &wallet_state.coin_public_key.chars().take(8).collect::<String>(),
        uris.indexer_uri
    );

    Ok(WalletBootstrap {
        connector,
        session,
        uris,
    })
}

/// Poll the environment until a connector shows up or the discovery budget
/// runs out.
async fn discover(
    env: &dyn HostEnvironment,
    cfg: &Config,
) -> Result<Arc<dyn WalletConnector>, ConnectorError> {
    let poll = async {
        let mut ticker = interval(cfg.connector_poll_interval());
        loop {
            ticker.tick().await;
            if let Some(connector) = env.connector() {
                return connector;
            }
        }
    };
    timeout(cfg.connector_discovery_timeout(), poll)
        .await
        .map_err(|_| ConnectorError::NotFound(cfg.connector_discovery_timeout_ms))
}

/// Match an advertised version against the required range. Accepted forms
/// for `required`: `"1.x"` / `"1"` (major match) or an exact version.
pub fn version_matches(required: &str, found: &str) -> bool {
    let required = required.trim();
    if let Some(major) = required
        .strip_suffix(".x")
        .or_else(|| required.strip_suffix(".X"))
    {
        return major_component(found) == Some(major);
    }
    if !required.contains('.') {
        return major_component(found) == Some(required);
    }
    found.trim() == required
}

fn major_component(version: &str) -> Option<&str> {
    version
        .trim()
        .split('.')
        .next()
        .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
