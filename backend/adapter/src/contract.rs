//! Collaborator contracts at the edges of this crate.
//!
//! The zero-knowledge circuits, the generated contract bindings, the wallet
//! extension, and the network services are all external; everything this
//! crate needs from them is captured in the traits below so the whole
//! pipeline can run against the real network or against `crate::sim`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::errors::{AdapterError, ConnectorError, Result, TxError};
use crate::ledger::{ContractAddress, LedgerSnapshot, RawLedgerState, SecretKey, TxHash};

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

/// Confirmed on-chain inclusion of a submitted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedTx {
    pub tx_hash: TxHash,
    pub block_height: u64,
}

/// A circuit call accepted for submission. The hash is available
/// immediately; finalization (a confirmed block height) is awaited
/// separately.
pub struct SubmittedCall {
    pub tx_hash: TxHash,
    finalized: oneshot::Receiver<std::result::Result<FinalizedTx, TxError>>,
}

impl SubmittedCall {
    pub fn new(
        tx_hash: TxHash,
        finalized: oneshot::Receiver<std::result::Result<FinalizedTx, TxError>>,
    ) -> Self {
        SubmittedCall { tx_hash, finalized }
    }

    /// Wait for the transaction to reach a confirmed block.
    pub async fn finalized(self) -> std::result::Result<FinalizedTx, TxError> {
        match self.finalized.await {
            Ok(result) => result,
            Err(_) => Err(TxError::Finalization(
                "finalization channel closed before confirmation".to_string(),
            )),
        }
    }
}

/// A transaction before and after proof generation / balancing. The adapter
/// treats both as opaque payloads moved between collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct UnprovenTx(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq)]
pub struct ProvenTx(pub serde_json::Value);

/// A spendable coin offered to the wallet for balancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinInfo {
    pub nonce: String,
    pub value: u64,
}

// ─────────────────────────────────────────────────────────
// Contract binding
// ─────────────────────────────────────────────────────────

/// The compiled contract interface, consumed as an opaque dependency.
///
/// `ledger` and `derive_public_key` are pure; the circuit calls submit to
/// the network and are awaitable to finalization via [`SubmittedCall`].
#[async_trait]
pub trait ContractBinding: Send + Sync {
    /// Project raw on-chain state into the invoice ledger view.
    fn ledger(&self, raw: &RawLedgerState) -> LedgerSnapshot;

    /// Recompute the buyer commitment for a secret at a given sequence.
    /// Black box; its only guaranteed property is determinism.
    fn derive_public_key(&self, secret: &SecretKey, sequence: u64) -> [u8; 32];

    /// Mint a fresh contract instance owned by `secret`'s holder.
    async fn deploy(&self, secret: &SecretKey) -> Result<ContractAddress>;

    /// Attach to an existing contract instance by address.
    async fn join(&self, address: &ContractAddress) -> Result<()>;

    async fn issue_invoice(
        &self,
        address: &ContractAddress,
        secret: &SecretKey,
        amount: u64,
        invoice_json: &str,
    ) -> std::result::Result<SubmittedCall, TxError>;

    /// The one call that needs a zero-knowledge proof: the caller's secret
    /// must match the recorded buyer commitment. The proof is produced by
    /// the external proof provider.
    async fn pay_invoice(
        &self,
        address: &ContractAddress,
        secret: &SecretKey,
    ) -> std::result::Result<SubmittedCall, TxError>;

    async fn reset_invoice(
        &self,
        address: &ContractAddress,
    ) -> std::result::Result<SubmittedCall, TxError>;
}

// ─────────────────────────────────────────────────────────
// Network-side providers
// ─────────────────────────────────────────────────────────

/// Public ledger-state source: at least one initial emission on subscribe,
/// then one per confirmed state change. Latest-wins semantics.
#[async_trait]
pub trait PublicDataProvider: Send + Sync {
    async fn subscribe(&self, address: &ContractAddress)
        -> Result<watch::Receiver<RawLedgerState>>;
}

/// Local persistence for secret material, keyed by a fixed identifier.
/// Exclusively owned by the current process.
#[async_trait]
pub trait PrivateStateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// External proof generation, accessed by URL only.
#[async_trait]
pub trait ProofProvider: Send + Sync {
    async fn prove(&self, tx: UnprovenTx) -> std::result::Result<ProvenTx, TxError>;
}

/// Fetches proving artifacts for a named circuit.
#[async_trait]
pub trait ZkConfigProvider: Send + Sync {
    async fn fetch_artifact(&self, circuit: &str) -> Result<Vec<u8>>;
}

// ─────────────────────────────────────────────────────────
// Wallet connector
// ─────────────────────────────────────────────────────────

/// Service endpoints advertised by the wallet connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUriConfig {
    pub indexer_uri: String,
    pub indexer_ws_uri: String,
    pub prover_server_uri: String,
}

/// Public key material held by the wallet session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletState {
    pub coin_public_key: String,
    pub encryption_public_key: String,
}

/// The injected browser-extension wallet.
#[async_trait]
pub trait WalletConnector: Send + Sync {
    fn api_version(&self) -> String;

    async fn is_enabled(&self) -> std::result::Result<bool, ConnectorError>;

    /// Request authorization from the user. Rejection maps to
    /// [`ConnectorError::NotAuthorized`].
    async fn enable(&self) -> std::result::Result<Arc<dyn WalletSession>, ConnectorError>;

    async fn service_uri_config(&self) -> std::result::Result<ServiceUriConfig, ConnectorError>;
}

/// An authorized wallet session.
#[async_trait]
pub trait WalletSession: Send + Sync {
    async fn state(&self) -> std::result::Result<WalletState, ConnectorError>;

    async fn balance_and_prove_transaction(
        &self,
        tx: UnprovenTx,
        coins: Vec<CoinInfo>,
    ) -> std::result::Result<ProvenTx, TxError>;

    async fn submit_transaction(&self, tx: ProvenTx) -> std::result::Result<TxHash, TxError>;
}

/// Explicit accessor for the host environment's injected connector,
/// replacing ambient global lookup so bootstrap is testable with a fake
/// environment.
pub trait HostEnvironment: Send + Sync {
    fn connector(&self) -> Option<Arc<dyn WalletConnector>>;
}

impl From<AdapterError> for TxError {
    fn from(e: AdapterError) -> Self {
        match e {
            AdapterError::Tx(tx) => tx,
            other => TxError::Submit(other.to_string()),
        }
    }
}
