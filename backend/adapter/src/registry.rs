//! Deployment registry.
//!
//! A process-wide, observable collection of deployment attempts. `resolve`
//! hands back an observable handle immediately ("subscribe now, resolve
//! later"); a spawned task drives the actual deploy-or-join and flips the
//! deployment's status exactly once, to `Deployed` or `Failed`. Failures
//! are values on the status stream, never panics across the boundary.
//!
//! Dedup rule: a resolve for an address whose deployment already reached
//! `Deployed` returns that same deployment. Fresh deploys are never merged,
//! since each one mints a new address.

use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::watch;
use tracing::{error, info};

use crate::api::InvoiceApi;
use crate::contract::{ContractBinding, PrivateStateStore};
use crate::errors::AdapterError;
use crate::ledger::{ContractAddress, SecretKey};
use crate::providers::{ProviderHub, Providers};

/// Lifecycle of one deployment attempt. Delivered over the status stream
/// as `InProgress`, then at most one terminal value, ever.
#[derive(Clone)]
pub enum DeploymentStatus {
    InProgress,
    Deployed(Arc<InvoiceApi>),
    Failed(Arc<AdapterError>),
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeploymentStatus::InProgress)
    }
}

/// One attempt to reach a usable contract instance. Owned by the registry;
/// consumers hold read-only observable handles.
pub struct Deployment {
    address: OnceLock<ContractAddress>,
    status: watch::Sender<DeploymentStatus>,
}

impl Deployment {
    fn new(address: Option<ContractAddress>) -> Self {
        let (status, _) = watch::channel(DeploymentStatus::InProgress);
        let slot = OnceLock::new();
        if let Some(addr) = address {
            let _ = slot.set(addr);
        }
        Deployment {
            address: slot,
            status,
        }
    }

    /// The contract address, once known. Present from the start for a join;
    /// set on success for a fresh deploy.
    pub fn address(&self) -> Option<&ContractAddress> {
        self.address.get()
    }

    pub fn status(&self) -> DeploymentStatus {
        self.status.borrow().clone()
    }

    /// Observe this deployment's own lifecycle, independent of every other
    /// entry in the registry.
    pub fn subscribe(&self) -> watch::Receiver<DeploymentStatus> {
        self.status.subscribe()
    }

    /// Wait for the terminal state and unwrap it.
    pub async fn deployed(&self) -> Result<Arc<InvoiceApi>, Arc<AdapterError>> {
        let mut rx = self.subscribe();
        loop {
            match rx.borrow_and_update().clone() {
                DeploymentStatus::Deployed(api) => return Ok(api),
                DeploymentStatus::Failed(e) => return Err(e),
                DeploymentStatus::InProgress => {}
            }
            if rx.changed().await.is_err() {
                return Err(Arc::new(AdapterError::Deployment(
                    "deployment dropped before completion".to_string(),
                )));
            }
        }
    }

    fn complete(&self, result: Result<Arc<InvoiceApi>, Arc<AdapterError>>) {
        let next = match result {
            Ok(api) => DeploymentStatus::Deployed(api),
            Err(e) => DeploymentStatus::Failed(e),
        };
        // Terminal transition happens at most once.
        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Observable, append-only snapshot of all deployments, in discovery order.
pub type DeploymentList = Arc<Vec<Arc<Deployment>>>;

pub struct Registry {
    hub: ProviderHub,
    binding: Arc<dyn ContractBinding>,
    private_state_key: String,
    collection: watch::Sender<DeploymentList>,
    // Serializes resolve's check-then-append so concurrent joins for the
    // same address cannot slip past the dedup check.
    resolve_lock: Mutex<()>,
}

impl Registry {
    pub fn new(hub: ProviderHub, binding: Arc<dyn ContractBinding>, private_state_key: &str) -> Self {
        let (collection, _) = watch::channel(Arc::new(Vec::new()));
        Registry {
            hub,
            binding,
            private_state_key: private_state_key.to_string(),
            collection,
            resolve_lock: Mutex::new(()),
        }
    }

    /// Subscribers learn about new deployments as they are appended, and can
    /// subscribe to each entry's own status stream independently.
    pub fn deployments(&self) -> watch::Receiver<DeploymentList> {
        self.collection.subscribe()
    }

    /// Deploy a fresh contract instance (no address) or join an existing one.
    /// Returns the observable handle before the asynchronous work has
    /// necessarily started.
    pub fn resolve(&self, address: Option<ContractAddress>) -> Arc<Deployment> {
        let guard = match self.resolve_lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(addr) = &address {
            if let Some(existing) = self.find_deployed(addr) {
                info!("Reusing deployed contract at {addr}");
                return existing;
            }
        }

        let deployment = Arc::new(Deployment::new(address.clone()));
        self.collection.send_modify(|list| {
            // Whole-collection replacement: concurrent readers keep their
            // consistent snapshot.
            let mut next = Vec::with_capacity(list.len() + 1);
            next.extend(list.iter().cloned());
            next.push(deployment.clone());
            *list = Arc::new(next);
        });
        drop(guard);

        let hub = self.hub.clone();
        let binding = self.binding.clone();
        let key = self.private_state_key.clone();
        let dep = deployment.clone();
        tokio::spawn(async move {
            drive(hub, binding, key, dep, address).await;
        });

        deployment
    }

    fn find_deployed(&self, address: &ContractAddress) -> Option<Arc<Deployment>> {
        let list = self.collection.borrow().clone();
        list.iter()
            .find(|dep| {
                dep.address() == Some(address)
                    && matches!(dep.status(), DeploymentStatus::Deployed(_))
            })
            .cloned()
    }
}

async fn drive(
    hub: ProviderHub,
    binding: Arc<dyn ContractBinding>,
    private_state_key: String,
    deployment: Arc<Deployment>,
    address: Option<ContractAddress>,
) {
    let dep = deployment.clone();
    let handle = tokio::spawn(async move { attempt(hub, binding, private_state_key, dep, address).await });

    // A panicking attempt is normalized to an ordinary failed deployment.
    let result = match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(Arc::new(AdapterError::Deployment(format!(
            "deployment task aborted: {join_err}"
        )))),
    };

    if let Err(e) = &result {
        error!("Deployment failed: {e}");
    }
    deployment.complete(result);
}

async fn attempt(
    hub: ProviderHub,
    binding: Arc<dyn ContractBinding>,
    private_state_key: String,
    deployment: Arc<Deployment>,
    address: Option<ContractAddress>,
) -> Result<Arc<InvoiceApi>, Arc<AdapterError>> {
    let providers = hub.get_or_init().await?;
    let secret = load_or_create_secret(&providers, &private_state_key)
        .await
        .map_err(Arc::new)?;

    let addr = match address {
        Some(addr) => {
            binding.join(&addr).await.map_err(Arc::new)?;
            addr
        }
        None => {
            let addr = binding.deploy(&secret).await.map_err(Arc::new)?;
            info!("Deployed new contract at {addr}");
            addr
        }
    };
    let _ = deployment.address.set(addr.clone());

    InvoiceApi::connect(addr, binding, providers, secret)
        .await
        .map_err(Arc::new)
}

/// Fetch the local secret, creating and persisting a fresh one if the store
/// has none. Joining a contract never requires pre-existing local state.
async fn load_or_create_secret(
    providers: &Providers,
    key: &str,
) -> Result<SecretKey, AdapterError> {
    match providers.private_state.get(key).await? {
        Some(bytes) => SecretKey::from_bytes(&bytes).ok_or_else(|| {
            AdapterError::PrivateState(format!(
                "stored secret under {key} has invalid length {}",
                bytes.len()
            ))
        }),
        None => {
            let secret = SecretKey::generate();
            providers.private_state.put(key, &secret.0).await?;
            info!("Generated fresh private state under {key}");
            Ok(secret)
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::sim_registry;

    #[tokio::test(start_paused = true)]
    async fn deploy_then_join_returns_the_same_deployment() {
        let (registry, _) = sim_registry();
        let first = registry.resolve(None);
        first.deployed().await.unwrap();
        let addr = first.address().cloned().unwrap();

        let second = registry.resolve(Some(addr.clone()));
        assert!(Arc::ptr_eq(&first, &second));
        // Repeated joins keep returning the one deployment.
        let third = registry.resolve(Some(addr));
        assert!(Arc::ptr_eq(&first, &third));

        let list = registry.deployments().borrow().clone();
        assert_eq!(list.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_deploys_are_never_merged() {
        let (registry, _) = sim_registry();
        let first = registry.resolve(None);
        let second = registry.resolve(None);
        assert!(!Arc::ptr_eq(&first, &second));

        first.deployed().await.unwrap();
        second.deployed().await.unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(registry.deployments().borrow().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn join_of_unknown_contract_fails_as_a_value() {
        let (registry, _) = sim_registry();
        let dep = registry.resolve(Some(ContractAddress::random()));
        let err = dep.deployed().await.unwrap_err();
        assert!(matches!(*err, AdapterError::UnknownContract(_)));
        // Terminal: the status stays failed.
        assert!(matches!(dep.status(), DeploymentStatus::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn collection_preserves_append_order() {
        let (registry, _) = sim_registry();
        let mut rx = registry.deployments();

        let first = registry.resolve(None);
        let second = registry.resolve(None);

        rx.mark_changed();
        rx.changed().await.unwrap();
        let list = rx.borrow_and_update().clone();
        assert_eq!(list.len(), 2);
        assert!(Arc::ptr_eq(&list[0], &first));
        assert!(Arc::ptr_eq(&list[1], &second));
    }

    #[tokio::test(start_paused = true)]
    async fn status_reaches_exactly_one_terminal_state() {
        let (registry, _) = sim_registry();
        let dep = registry.resolve(None);
        let mut rx = dep.subscribe();

        dep.deployed().await.unwrap();
        rx.mark_changed();
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_terminal());

        // No further transition ever arrives.
        let quiet =
            tokio::time::timeout(std::time::Duration::from_millis(250), rx.changed()).await;
        assert!(quiet.is_err());
    }
}
