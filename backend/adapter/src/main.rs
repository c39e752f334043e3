//! Invoice adapter — demo entry point.
//!
//! Runs the full pipeline against the in-process simulation: the connector
//! is injected a beat after startup (as a browser extension would be),
//! bootstrap discovers and authorizes it, the registry deploys a fresh
//! contract, and one issue → pay → reset cycle streams by as derived
//! snapshots.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use invoice_adapter::contract::ContractBinding;
use invoice_adapter::sim::{
    SimBinding, SimConnector, SimEnvironment, SimNetwork, SimProver, SimProviderFactory,
};
use invoice_adapter::{Config, InvoiceData, ProviderHub, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // ─── Simulated collaborators ──────────────────────────
    let network = Arc::new(SimNetwork::new());
    let prover = Arc::new(SimProver::new());
    let binding: Arc<dyn ContractBinding> =
        Arc::new(SimBinding::new(network.clone(), prover.clone()));
    let env = SimEnvironment::new();
    env.inject_after(
        Arc::new(SimConnector::new("1.0.0")),
        Duration::from_millis(250),
    );

    // ─── Bootstrap and deploy ─────────────────────────────
    let hub = ProviderHub::new(
        env,
        Arc::new(SimProviderFactory::new(network, prover)),
        config.clone(),
    );
    let registry = Registry::new(hub, binding, &config.private_state_key);

    let deployment = registry.resolve(None);
    let api = deployment
        .deployed()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("Contract ready at {}", api.address());

    // ─── Stream derived snapshots ─────────────────────────
    let mut rx = api.state();
    tokio::spawn(async move {
        loop {
            {
                let snap = rx.borrow_and_update();
                info!(
                    "Derived state: {:?} seq={} amount={} can_pay={} history={}",
                    snap.state,
                    snap.sequence,
                    snap.amount,
                    snap.can_pay,
                    snap.tx_history.len()
                );
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    });

    // ─── One full invoice cycle ───────────────────────────
    let invoice = InvoiceData {
        title: "Adapter demo".to_string(),
        description: "End-to-end simulated run".to_string(),
        issued_at: "2025-01-01".to_string(),
        currency: "NIGHT".to_string(),
    };
    api.issue_invoice(25_000, &invoice).await?;
    api.pay_invoice().await?;
    api.reset_invoice().await?;

    // Let the composer publish the final snapshot before summarizing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    for entry in api.history() {
        info!(
            "History: {:?} tx={} block={}",
            entry.kind, entry.tx_hash, entry.block_height
        );
    }

    Ok(())
}
