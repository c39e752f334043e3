//! In-process simulation of every external collaborator: chain, contract
//! binding, proof provider, wallet connector, and private-state store.
//!
//! The simulated chain enforces the same transition rules the real contract
//! does (EMPTY → ISSUED → PAID → EMPTY), records a buyer commitment at
//! issue time, and verifies the "proof" carried by a pay transaction
//! against it. Used by the demo binary and throughout the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, watch};

use crate::config::Config;
use crate::contract::{
    CoinInfo, ContractBinding, FinalizedTx, HostEnvironment, PrivateStateStore, ProofProvider,
    ProvenTx, PublicDataProvider, ServiceUriConfig, SubmittedCall, UnprovenTx, WalletConnector,
    WalletSession, WalletState, ZkConfigProvider,
};
use crate::errors::{AdapterError, ConnectorError, Result, TxError};
use crate::ledger::{
    ContractAddress, InvoiceState, LedgerSnapshot, RawLedgerState, SecretKey, TxHash,
};
use crate::providers::{ProviderFactory, ProviderHub, Providers};
use crate::registry::Registry;

/// Latency injected before a simulated circuit call is applied. Paused-time
/// tests skip over it instantly.
const SIM_SUBMIT_LATENCY: Duration = Duration::from_millis(5);

fn commitment(secret: &SecretKey, sequence: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.0);
    hasher.update(sequence.to_be_bytes());
    hasher.finalize().into()
}

// ─────────────────────────────────────────────────────────
// Simulated chain
// ─────────────────────────────────────────────────────────

struct ChainInner {
    state: InvoiceState,
    sequence: u64,
    amount: u64,
    buyer_pk: [u8; 32],
    invoice_json: String,
    height: u64,
}

impl ChainInner {
    fn raw(&self) -> RawLedgerState {
        RawLedgerState(json!({
            "state": self.state.as_str(),
            "sequence": self.sequence,
            "amount": self.amount,
            "buyerPk": hex::encode(self.buyer_pk),
            "invoiceJson": self.invoice_json,
        }))
    }
}

/// One deployed contract instance on the simulated network.
pub struct SimChain {
    inner: Mutex<ChainInner>,
    raw_tx: watch::Sender<RawLedgerState>,
}

impl SimChain {
    fn new() -> Self {
        let inner = ChainInner {
            state: InvoiceState::Empty,
            sequence: 1,
            amount: 0,
            buyer_pk: [0u8; 32],
            invoice_json: String::new(),
            height: 0,
        };
        let (raw_tx, _) = watch::channel(inner.raw());
        SimChain {
            inner: Mutex::new(inner),
            raw_tx,
        }
    }

    fn subscribe(&self) -> watch::Receiver<RawLedgerState> {
        self.raw_tx.subscribe()
    }

    /// Apply one transaction under the on-chain rules, confirm it in a new
    /// block, and publish the updated state to subscribers.
    fn apply<F>(&self, label: &str, f: F) -> std::result::Result<FinalizedTx, TxError>
    where
        F: FnOnce(&mut ChainInner) -> std::result::Result<(), TxError>,
    {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut inner)?;
        inner.height += 1;
        let tx_hash = TxHash(hex::encode(Sha256::digest(format!(
            "{label}:{}",
            inner.height
        ))));
        let finalized = FinalizedTx {
            tx_hash,
            block_height: inner.height,
        };
        let raw = inner.raw();
        drop(inner);
        self.raw_tx.send_replace(raw);
        Ok(finalized)
    }
}

/// The simulated network: a map of deployed contract instances.
pub struct SimNetwork {
    chains: Mutex<HashMap<ContractAddress, Arc<SimChain>>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        SimNetwork {
            chains: Mutex::new(HashMap::new()),
        }
    }

    fn deploy(&self) -> ContractAddress {
        let address = ContractAddress::random();
        let mut chains = self.lock_chains();
        chains.insert(address.clone(), Arc::new(SimChain::new()));
        address
    }

    fn chain(&self, address: &ContractAddress) -> Result<Arc<SimChain>> {
        self.lock_chains()
            .get(address)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownContract(address.to_string()))
    }

    /// Overwrite the on-chain invoice payload with arbitrary bytes, as a
    /// hostile or buggy issuer could. Test hook.
    pub fn corrupt_invoice_json(&self, address: &ContractAddress, payload: &str) {
        if let Ok(chain) = self.chain(address) {
            let _ = chain.apply("corrupt", |inner| {
                inner.invoice_json = payload.to_string();
                Ok(())
            });
        }
    }

    fn lock_chains(&self) -> std::sync::MutexGuard<'_, HashMap<ContractAddress, Arc<SimChain>>> {
        match self.chains.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublicDataProvider for SimNetwork {
    async fn subscribe(
        &self,
        address: &ContractAddress,
    ) -> Result<watch::Receiver<RawLedgerState>> {
        Ok(self.chain(address)?.subscribe())
    }
}

// ─────────────────────────────────────────────────────────
// Simulated contract binding
// ─────────────────────────────────────────────────────────

/// Stand-in for the compiled contract interface, backed by [`SimNetwork`].
pub struct SimBinding {
    network: Arc<SimNetwork>,
    proof: Arc<dyn ProofProvider>,
}

impl SimBinding {
    pub fn new(network: Arc<SimNetwork>, proof: Arc<dyn ProofProvider>) -> Self {
        SimBinding { network, proof }
    }

    fn submitted(finalized: FinalizedTx) -> SubmittedCall {
        let (tx, rx) = oneshot::channel();
        let call = SubmittedCall::new(finalized.tx_hash.clone(), rx);
        let _ = tx.send(Ok(finalized));
        call
    }
}

#[async_trait]
impl ContractBinding for SimBinding {
    fn ledger(&self, raw: &RawLedgerState) -> LedgerSnapshot {
        let value = &raw.0;
        let state = value
            .get("state")
            .and_then(|v| v.as_str())
            .and_then(InvoiceState::from_str)
            .unwrap_or_default();
        let buyer_pk = value
            .get("buyerPk")
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .unwrap_or([0u8; 32]);
        LedgerSnapshot {
            state,
            sequence: value.get("sequence").and_then(|v| v.as_u64()).unwrap_or(0),
            amount: value.get("amount").and_then(|v| v.as_u64()).unwrap_or(0),
            buyer_pk,
            invoice_json: value
                .get("invoiceJson")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }
    }

    fn derive_public_key(&self, secret: &SecretKey, sequence: u64) -> [u8; 32] {
        commitment(secret, sequence)
    }

    async fn deploy(&self, _secret: &SecretKey) -> Result<ContractAddress> {
        tokio::time::sleep(SIM_SUBMIT_LATENCY).await;
        Ok(self.network.deploy())
    }

    async fn join(&self, address: &ContractAddress) -> Result<()> {
        self.network.chain(address).map(|_| ())
    }

    async fn issue_invoice(
        &self,
        address: &ContractAddress,
        secret: &SecretKey,
        amount: u64,
        invoice_json: &str,
    ) -> std::result::Result<SubmittedCall, TxError> {
        tokio::time::sleep(SIM_SUBMIT_LATENCY).await;
        let chain = self.network.chain(address)?;
        let finalized = chain.apply("issue", |inner| {
            if inner.state != InvoiceState::Empty {
                return Err(TxError::Rejected(format!(
                    "issue requires EMPTY state, found {}",
                    inner.state.as_str()
                )));
            }
            inner.state = InvoiceState::Issued;
            inner.amount = amount;
            inner.invoice_json = invoice_json.to_string();
            inner.buyer_pk = commitment(secret, inner.sequence);
            Ok(())
        })?;
        Ok(Self::submitted(finalized))
    }

    async fn pay_invoice(
        &self,
        address: &ContractAddress,
        secret: &SecretKey,
    ) -> std::result::Result<SubmittedCall, TxError> {
        tokio::time::sleep(SIM_SUBMIT_LATENCY).await;
        let chain = self.network.chain(address)?;

        let sequence = {
            let inner = match chain.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.sequence
        };
        // The proof asserts knowledge of a secret matching the recorded
        // commitment without revealing it; only the derived key travels.
        let unproven = UnprovenTx(json!({
            "circuit": "pay_invoice",
            "secret": hex::encode(secret.0),
            "sequence": sequence,
        }));
        let proven = self.proof.prove(unproven).await?;
        let key = proven
            .0
            .get("key")
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or_else(|| TxError::Proof("malformed proof payload".to_string()))?;

        let finalized = chain.apply("pay", |inner| {
            if inner.state != InvoiceState::Issued {
                return Err(TxError::Rejected(format!(
                    "pay requires ISSUED state, found {}",
                    inner.state.as_str()
                )));
            }
            if key != inner.buyer_pk {
                return Err(TxError::Rejected(
                    "proof does not match buyer commitment".to_string(),
                ));
            }
            inner.state = InvoiceState::Paid;
            Ok(())
        })?;
        Ok(Self::submitted(finalized))
    }

    async fn reset_invoice(
        &self,
        address: &ContractAddress,
    ) -> std::result::Result<SubmittedCall, TxError> {
        tokio::time::sleep(SIM_SUBMIT_LATENCY).await;
        let chain = self.network.chain(address)?;
        let finalized = chain.apply("reset", |inner| {
            if inner.state != InvoiceState::Paid {
                return Err(TxError::Rejected(format!(
                    "reset requires PAID state, found {}",
                    inner.state.as_str()
                )));
            }
            inner.state = InvoiceState::Empty;
            inner.sequence += 1;
            inner.amount = 0;
            inner.invoice_json.clear();
            // The stale commitment stays on-chain until the next issue.
            Ok(())
        })?;
        Ok(Self::submitted(finalized))
    }
}

// ─────────────────────────────────────────────────────────
// Simulated proof and zk-config providers
// ─────────────────────────────────────────────────────────

pub struct SimProver {
    prove_calls: AtomicUsize,
    failing: AtomicBool,
}

impl SimProver {
    pub fn new() -> Self {
        SimProver {
            prove_calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn prove_calls(&self) -> usize {
        self.prove_calls.load(Ordering::SeqCst)
    }

    /// Make subsequent prove calls fail (or succeed again).
    pub fn fail_next(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for SimProver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProofProvider for SimProver {
    async fn prove(&self, tx: UnprovenTx) -> std::result::Result<ProvenTx, TxError> {
        self.prove_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(TxError::Proof("prover unavailable".to_string()));
        }
        let secret_hex = tx
            .0
            .get("secret")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TxError::Proof("missing witness".to_string()))?;
        let sequence = tx
            .0
            .get("sequence")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| TxError::Proof("missing sequence".to_string()))?;
        let secret = hex::decode(secret_hex)
            .ok()
            .and_then(|bytes| SecretKey::from_bytes(&bytes))
            .ok_or_else(|| TxError::Proof("malformed witness".to_string()))?;
        // The witness is consumed here; the output carries only the key.
        Ok(ProvenTx(json!({
            "circuit": tx.0.get("circuit"),
            "key": hex::encode(commitment(&secret, sequence)),
        })))
    }
}

pub struct SimZkConfig;

#[async_trait]
impl ZkConfigProvider for SimZkConfig {
    async fn fetch_artifact(&self, circuit: &str) -> Result<Vec<u8>> {
        Ok(format!("sim-artifact:{circuit}").into_bytes())
    }
}

// ─────────────────────────────────────────────────────────
// Simulated wallet connector and environment
// ─────────────────────────────────────────────────────────

pub struct SimSession;

#[async_trait]
impl WalletSession for SimSession {
    async fn state(&self) -> std::result::Result<WalletState, ConnectorError> {
        Ok(WalletState {
            coin_public_key: "simcoinpk0000000000000000000000000000000".to_string(),
            encryption_public_key: "simencpk0000000000000000000000000000000".to_string(),
        })
    }

    async fn balance_and_prove_transaction(
        &self,
        tx: UnprovenTx,
        _coins: Vec<CoinInfo>,
    ) -> std::result::Result<ProvenTx, TxError> {
        Ok(ProvenTx(tx.0))
    }

    async fn submit_transaction(&self, tx: ProvenTx) -> std::result::Result<TxHash, TxError> {
        Ok(TxHash(hex::encode(Sha256::digest(tx.0.to_string()))))
    }
}

/// A configurable fake of the injected browser-extension wallet.
pub struct SimConnector {
    version: String,
    responsive: bool,
    authorized: AtomicBool,
    enable_delay_ms: u64,
    enable_calls: AtomicUsize,
    session: Arc<SimSession>,
    uris: ServiceUriConfig,
}

impl SimConnector {
    pub fn new(version: &str) -> Self {
        SimConnector {
            version: version.to_string(),
            responsive: true,
            authorized: AtomicBool::new(true),
            enable_delay_ms: 0,
            enable_calls: AtomicUsize::new(0),
            session: Arc::new(SimSession),
            uris: ServiceUriConfig {
                indexer_uri: "http://127.0.0.1:8088".to_string(),
                indexer_ws_uri: "ws://127.0.0.1:8088/ws".to_string(),
                prover_server_uri: "http://127.0.0.1:6300".to_string(),
            },
        }
    }

    /// A connector whose health check never answers.
    pub fn unresponsive(mut self) -> Self {
        self.responsive = false;
        self
    }

    /// A connector whose user rejects the authorization prompt.
    pub fn unauthorized(self) -> Self {
        self.authorized.store(false, Ordering::SeqCst);
        self
    }

    /// Delay `enable` answers, so concurrent bootstrap callers overlap.
    pub fn with_enable_delay(mut self, millis: u64) -> Self {
        self.enable_delay_ms = millis;
        self
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.store(authorized, Ordering::SeqCst);
    }

    pub fn enable_calls(&self) -> usize {
        self.enable_calls.load(Ordering::SeqCst)
    }

    pub fn uris(&self) -> ServiceUriConfig {
        self.uris.clone()
    }
}

#[async_trait]
impl WalletConnector for SimConnector {
    fn api_version(&self) -> String {
        self.version.clone()
    }

    async fn is_enabled(&self) -> std::result::Result<bool, ConnectorError> {
        if !self.responsive {
            std::future::pending::<()>().await;
        }
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn enable(&self) -> std::result::Result<Arc<dyn WalletSession>, ConnectorError> {
        self.enable_calls.fetch_add(1, Ordering::SeqCst);
        if self.enable_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.enable_delay_ms)).await;
        }
        if !self.authorized.load(Ordering::SeqCst) {
            return Err(ConnectorError::NotAuthorized);
        }
        Ok(self.session.clone())
    }

    async fn service_uri_config(&self) -> std::result::Result<ServiceUriConfig, ConnectorError> {
        Ok(self.uris.clone())
    }
}

/// Fake host environment; a connector can be injected immediately or after
/// a delay, to exercise the discovery poll.
pub struct SimEnvironment {
    connector: Mutex<Option<Arc<dyn WalletConnector>>>,
}

impl SimEnvironment {
    pub fn new() -> Arc<Self> {
        Arc::new(SimEnvironment {
            connector: Mutex::new(None),
        })
    }

    pub fn inject(&self, connector: Arc<dyn WalletConnector>) {
        match self.connector.lock() {
            Ok(mut slot) => *slot = Some(connector),
            Err(poisoned) => *poisoned.into_inner() = Some(connector),
        }
    }

    pub fn inject_after(self: &Arc<Self>, connector: Arc<dyn WalletConnector>, delay: Duration) {
        let env = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            env.inject(connector);
        });
    }
}

impl HostEnvironment for SimEnvironment {
    fn connector(&self) -> Option<Arc<dyn WalletConnector>> {
        match self.connector.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────
// In-memory private state store
// ─────────────────────────────────────────────────────────

pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrivateStateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Bundle factory and end-to-end wiring
// ─────────────────────────────────────────────────────────

/// Provider factory backed entirely by the simulation.
pub struct SimProviderFactory {
    network: Arc<SimNetwork>,
    prover: Arc<SimProver>,
}

impl SimProviderFactory {
    pub fn new(network: Arc<SimNetwork>, prover: Arc<SimProver>) -> Self {
        SimProviderFactory { network, prover }
    }
}

#[async_trait]
impl ProviderFactory for SimProviderFactory {
    async fn build(&self, boot: crate::wallet::WalletBootstrap) -> Result<Providers> {
        Ok(Providers {
            session: boot.session,
            private_state: Arc::new(MemoryStateStore::new()),
            public_data: self.network.clone(),
            proof: self.prover.clone(),
            zk_config: Arc::new(SimZkConfig),
            uris: boot.uris,
        })
    }
}

/// Shared handles into the simulation, for assertions and fault injection.
pub struct SimHandles {
    pub network: Arc<SimNetwork>,
    pub prover: Arc<SimProver>,
    pub connector: Arc<SimConnector>,
}

/// A fully wired registry over the simulation: connector injected up
/// front, default configuration.
pub fn sim_registry() -> (Registry, SimHandles) {
    let network = Arc::new(SimNetwork::new());
    let prover = Arc::new(SimProver::new());
    let connector = Arc::new(SimConnector::new("1.0.0"));
    let env = SimEnvironment::new();
    env.inject(connector.clone());

    let config = Config::default();
    let hub = ProviderHub::new(
        env,
        Arc::new(SimProviderFactory::new(network.clone(), prover.clone())),
        config.clone(),
    );
    let binding: Arc<dyn ContractBinding> = Arc::new(SimBinding::new(network.clone(), prover.clone()));
    let registry = Registry::new(hub, binding, &config.private_state_key);

    (
        registry,
        SimHandles {
            network,
            prover,
            connector,
        },
    )
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn chain_enforces_the_transition_cycle() {
        let network = Arc::new(SimNetwork::new());
        let prover = Arc::new(SimProver::new());
        let binding = SimBinding::new(network.clone(), prover);
        let secret = SecretKey::generate();

        let address = binding.deploy(&secret).await.unwrap();

        // PAY and RESET are rejected before anything is issued.
        assert!(matches!(
            binding.pay_invoice(&address, &secret).await,
            Err(TxError::Rejected(_))
        ));
        assert!(matches!(
            binding.reset_invoice(&address).await,
            Err(TxError::Rejected(_))
        ));

        let issued = binding
            .issue_invoice(&address, &secret, 10, r#"{"title":"T","description":"D","issuedAt":"2025-01-01","currency":"NIGHT"}"#)
            .await
            .unwrap();
        let issued = issued.finalized().await.unwrap();
        assert_eq!(issued.block_height, 1);

        // Double issue rejected.
        assert!(matches!(
            binding.issue_invoice(&address, &secret, 10, "{}").await,
            Err(TxError::Rejected(_))
        ));

        // A different secret cannot pay.
        let stranger = SecretKey::generate();
        assert!(matches!(
            binding.pay_invoice(&address, &stranger).await,
            Err(TxError::Rejected(_))
        ));

        let paid = binding.pay_invoice(&address, &secret).await.unwrap();
        assert_eq!(paid.finalized().await.unwrap().block_height, 2);
        let reset = binding.reset_invoice(&address).await.unwrap();
        assert_eq!(reset.finalized().await.unwrap().block_height, 3);

        // Sequence advanced with the reset.
        let raw = network.subscribe(&address).await.unwrap().borrow().clone();
        let snapshot = binding.ledger(&raw);
        assert_eq!(snapshot.sequence, 2);
        assert_eq!(snapshot.state, InvoiceState::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_projection_survives_garbage_state() {
        let network = Arc::new(SimNetwork::new());
        let binding = SimBinding::new(network, Arc::new(SimProver::new()));
        let snapshot = binding.ledger(&RawLedgerState(json!({"state": "nonsense"})));
        assert_eq!(snapshot, LedgerSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn prover_strips_the_witness() {
        let prover = SimProver::new();
        let secret = SecretKey::generate();
        let proven = prover
            .prove(UnprovenTx(json!({
                "circuit": "pay_invoice",
                "secret": hex::encode(secret.0),
                "sequence": 7,
            })))
            .await
            .unwrap();
        assert!(proven.0.get("secret").is_none());
        assert_eq!(
            proven.0.get("key").and_then(|v| v.as_str()),
            Some(hex::encode(commitment(&secret, 7)).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn memory_store_round_trips() {
        let store = MemoryStateStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
        store.put("k", &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
