//! Provider bundle assembly.
//!
//! Exactly one bundle of collaborator handles exists per process lifetime,
//! no matter how many concurrent callers ask for it — this is the single
//! synchronization point preventing duplicate wallet-authorization prompts.
//! The in-flight construction itself is shared: late callers attach to the
//! same initialization over a watch channel instead of starting another
//! bootstrap. A failed initialization latches until [`ProviderHub::reset`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::config::Config;
use crate::contract::{
    HostEnvironment, PrivateStateStore, ProofProvider, PublicDataProvider, ServiceUriConfig,
    WalletSession, ZkConfigProvider,
};
use crate::errors::AdapterError;
use crate::wallet::{self, WalletBootstrap};

/// The immutable, process-wide bundle of collaborator handles.
pub struct Providers {
    pub session: Arc<dyn WalletSession>,
    pub private_state: Arc<dyn PrivateStateStore>,
    pub public_data: Arc<dyn PublicDataProvider>,
    pub proof: Arc<dyn ProofProvider>,
    pub zk_config: Arc<dyn ZkConfigProvider>,
    pub uris: ServiceUriConfig,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("uris", &self.uris)
            .finish_non_exhaustive()
    }
}

/// Builds the concrete providers once the wallet session is up. The demo
/// and tests plug in simulated collaborators here; production wires the
/// HTTP/SQLite implementations against the bootstrap's service URIs.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn build(&self, boot: WalletBootstrap) -> Result<Providers, AdapterError>;
}

type InitResult = Result<Arc<Providers>, Arc<AdapterError>>;

enum BundleState {
    Uninitialized,
    Initializing(watch::Receiver<Option<InitResult>>),
    Ready(Arc<Providers>),
    Failed(Arc<AdapterError>),
}

struct HubInner {
    env: Arc<dyn HostEnvironment>,
    factory: Arc<dyn ProviderFactory>,
    config: Config,
    state: Mutex<BundleState>,
}

/// Lazy, memoized, concurrency-safe access to the shared [`Providers`].
#[derive(Clone)]
pub struct ProviderHub {
    inner: Arc<HubInner>,
}

impl ProviderHub {
    pub fn new(
        env: Arc<dyn HostEnvironment>,
        factory: Arc<dyn ProviderFactory>,
        config: Config,
    ) -> Self {
        ProviderHub {
            inner: Arc::new(HubInner {
                env,
                factory,
                config,
                state: Mutex::new(BundleState::Uninitialized),
            }),
        }
    }

    /// Return the shared bundle, starting (or attaching to) initialization
    /// as needed. Every waiter observes the same outcome.
    pub async fn get_or_init(&self) -> InitResult {
        let rx = {
            let mut state = self.inner.state.lock().await;
            match &*state {
                BundleState::Ready(bundle) => return Ok(bundle.clone()),
                BundleState::Failed(e) => return Err(e.clone()),
                BundleState::Initializing(rx) => rx.clone(),
                BundleState::Uninitialized => {
                    let (tx, rx) = watch::channel(None);
                    *state = BundleState::Initializing(rx.clone());
                    let inner = self.inner.clone();
                    // The initialization runs in its own task so a cancelled
                    // first caller cannot strand the waiters.
                    tokio::spawn(async move { initialize(inner, tx).await });
                    rx
                }
            }
        };
        wait_for_init(self.inner.clone(), rx).await
    }

    /// Clear a latched failure so the next caller retries from scratch.
    /// A ready or in-flight bundle is left untouched.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        if matches!(&*state, BundleState::Failed(_)) {
            info!("Provider bundle reset after failure");
            *state = BundleState::Uninitialized;
        }
    }
}

async fn initialize(inner: Arc<HubInner>, tx: watch::Sender<Option<InitResult>>) {
    let result = run_init(&inner).await;
    let shared: InitResult = match result {
        Ok(providers) => Ok(Arc::new(providers)),
        Err(e) => Err(Arc::new(e)),
    };

    let mut state = inner.state.lock().await;
    match &shared {
        Ok(bundle) => *state = BundleState::Ready(bundle.clone()),
        Err(e) => {
            error!("Provider bundle initialization failed: {e}");
            *state = BundleState::Failed(e.clone());
        }
    }
    drop(state);

    tx.send_replace(Some(shared));
}

async fn run_init(inner: &HubInner) -> Result<Providers, AdapterError> {
    let boot = wallet::bootstrap(inner.env.as_ref(), &inner.config).await?;
    inner.factory.build(boot).await
}

async fn wait_for_init(
    inner: Arc<HubInner>,
    mut rx: watch::Receiver<Option<InitResult>>,
) -> InitResult {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        if rx.changed().await.is_err() {
            // The initialization task died without publishing (panicked or
            // aborted at runtime teardown). Latch the failure so `reset`
            // can clear it; the task may still have stored an outcome
            // between closing the channel and this lock.
            let err = Arc::new(AdapterError::Provider(
                "initialization task dropped before completion".to_string(),
            ));
            let mut state = inner.state.lock().await;
            match &*state {
                BundleState::Ready(bundle) => return Ok(bundle.clone()),
                BundleState::Failed(e) => return Err(e.clone()),
                _ => {
                    error!("Provider bundle initialization task died: {err}");
                    *state = BundleState::Failed(err.clone());
                    return Err(err);
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Production factory
// ─────────────────────────────────────────────────────────

/// Wires the HTTP and SQLite providers against the service URIs the wallet
/// connector advertised.
pub struct HttpProviderFactory {
    config: Config,
}

impl HttpProviderFactory {
    pub fn new(config: Config) -> Self {
        HttpProviderFactory { config }
    }
}

#[async_trait]
impl ProviderFactory for HttpProviderFactory {
    async fn build(&self, boot: WalletBootstrap) -> Result<Providers, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let private_state = crate::db::SqliteStateStore::open(&self.config.database_url).await?;
        let public_data = crate::indexer::IndexerClient::new(
            client.clone(),
            &boot.uris.indexer_uri,
            self.config.indexer_poll_interval(),
        );
        let proof =
            crate::proof::HttpProofProvider::new(client.clone(), &boot.uris.prover_server_uri);
        let zk_config =
            crate::proof::HttpZkConfigProvider::new(client, &boot.uris.prover_server_uri);

        Ok(Providers {
            session: boot.session,
            private_state: Arc::new(private_state),
            public_data: Arc::new(public_data),
            proof: Arc::new(proof),
            zk_config: Arc::new(zk_config),
            uris: boot.uris,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::sim::{SimConnector, SimEnvironment, SimNetwork, SimProver, SimProviderFactory};

    /// Panics on the first build, then delegates to the simulation.
    struct PanicOnceFactory {
        inner: SimProviderFactory,
        panicked: AtomicBool,
    }

    #[async_trait]
    impl ProviderFactory for PanicOnceFactory {
        async fn build(&self, boot: WalletBootstrap) -> Result<Providers, AdapterError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("factory fell over");
            }
            self.inner.build(boot).await
        }
    }

    fn sim_hub(connector: Arc<SimConnector>) -> ProviderHub {
        let env = SimEnvironment::new();
        env.inject(connector);
        let network = Arc::new(SimNetwork::new());
        let prover = Arc::new(SimProver::new());
        ProviderHub::new(
            env,
            Arc::new(SimProviderFactory::new(network, prover)),
            Config::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_bootstrap() {
        // The sim connector answers `enable` after a short delay, so all
        // ten callers overlap the same in-flight initialization.
        let connector = Arc::new(SimConnector::new("1.0.0").with_enable_delay(10));
        let hub = sim_hub(connector.clone());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.get_or_init().await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(connector.enable_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_calls_reuse_the_ready_bundle() {
        let connector = Arc::new(SimConnector::new("1.0.0"));
        let hub = sim_hub(connector.clone());

        let first = hub.get_or_init().await.unwrap();
        let second = hub.get_or_init().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.enable_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_shared_and_latched_until_reset() {
        let connector = Arc::new(SimConnector::new("1.0.0").unauthorized());
        let hub = sim_hub(connector.clone());

        assert!(hub.get_or_init().await.is_err());
        // Latched: no second authorization prompt without an explicit reset.
        assert!(hub.get_or_init().await.is_err());
        assert_eq!(connector.enable_calls(), 1);

        connector.set_authorized(true);
        hub.reset().await;
        assert!(hub.get_or_init().await.is_ok());
        assert_eq!(connector.enable_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_initialization_latches_as_failed_until_reset() {
        let connector = Arc::new(SimConnector::new("1.0.0"));
        let env = SimEnvironment::new();
        env.inject(connector.clone());
        let network = Arc::new(SimNetwork::new());
        let prover = Arc::new(SimProver::new());
        let factory = Arc::new(PanicOnceFactory {
            inner: SimProviderFactory::new(network, prover),
            panicked: AtomicBool::new(false),
        });
        let hub = ProviderHub::new(env, factory, Config::default());

        // The init task dies without publishing; the hub records the
        // failure instead of staying stuck in-flight.
        let err = hub.get_or_init().await.unwrap_err();
        assert!(matches!(*err, AdapterError::Provider(_)));
        assert!(hub.get_or_init().await.is_err());

        hub.reset().await;
        assert!(hub.get_or_init().await.is_ok());
        assert_eq!(connector.enable_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_observe_a_failure_in_flight() {
        let connector = Arc::new(SimConnector::new("1.0.0").unauthorized().with_enable_delay(10));
        let hub = sim_hub(connector.clone());

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.get_or_init().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(hub.get_or_init().await.is_err());
        assert!(waiter.await.unwrap().is_err());
        assert_eq!(connector.enable_calls(), 1);
    }
}
