//! Invoice contract API adapter.
//!
//! Fuses the public ledger-state stream with locally held secret material
//! into one continuous derived view, and wraps the three circuit calls
//! (issue / pay / reset) with finalization tracking and a local transaction
//! history. No local pre-validation of state transitions is done — the
//! on-chain rule set is authoritative, and a rejected call surfaces as an
//! ordinary [`TxError`].

use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::contract::{ContractBinding, PublicDataProvider};
use crate::errors::{Result, TxError};
use crate::ledger::{
    parse_invoice, ContractAddress, InvoiceData, InvoiceState, LedgerSnapshot, RawLedgerState,
    SecretKey, TxHash,
};
use crate::providers::Providers;

/// What a finalized operation recorded. Immutable once appended; appended
/// only after the network confirmed a block height, in completion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Issue,
    Payment,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxHistoryEntry {
    pub kind: TxKind,
    pub tx_hash: TxHash,
    pub block_height: u64,
    /// Unix seconds at finalization, local clock.
    pub timestamp: i64,
    pub amount: Option<u64>,
    pub invoice_data: Option<InvoiceData>,
}

/// The fused, UI-ready snapshot: ledger projection + locally derived
/// authorization flag + a copy of the accumulated history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedState {
    pub state: InvoiceState,
    pub sequence: u64,
    pub amount: u64,
    pub invoice_data: Option<InvoiceData>,
    /// True iff the locally recomputed commitment matches the on-chain
    /// buyer commitment for the current sequence.
    pub can_pay: bool,
    pub tx_history: Vec<TxHistoryEntry>,
}

/// Handle to one deployed invoice contract.
pub struct InvoiceApi {
    address: ContractAddress,
    binding: Arc<dyn ContractBinding>,
    providers: Arc<Providers>,
    secret: SecretKey,
    history: Mutex<Vec<TxHistoryEntry>>,
    history_tick: watch::Sender<u64>,
    state_tx: watch::Sender<DerivedState>,
}

impl std::fmt::Debug for InvoiceApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvoiceApi")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl InvoiceApi {
    /// Subscribe to the contract's public state and start the composer
    /// task. The returned handle's stream already carries a composed
    /// initial snapshot.
    pub async fn connect(
        address: ContractAddress,
        binding: Arc<dyn ContractBinding>,
        providers: Arc<Providers>,
        secret: SecretKey,
    ) -> Result<Arc<Self>> {
        let mut raw_rx = providers.public_data.subscribe(&address).await?;
        let (history_tick, tick_rx) = watch::channel(0u64);
        let (state_tx, _) = watch::channel(DerivedState::default());

        let api = Arc::new(InvoiceApi {
            address,
            binding,
            providers,
            secret,
            history: Mutex::new(Vec::new()),
            history_tick,
            state_tx,
        });

        let initial_raw = raw_rx.borrow_and_update().clone();
        let initial = api.compose(&api.binding.ledger(&initial_raw));
        api.state_tx.send_replace(initial);

        // The composer holds only a weak handle so dropping the api tears
        // the stream down with it.
        tokio::spawn(compose_loop(Arc::downgrade(&api), raw_rx, tick_rx));
        Ok(api)
    }

    pub fn address(&self) -> &ContractAddress {
        &self.address
    }

    /// The provider bundle this adapter was assembled from.
    pub fn providers(&self) -> &Providers {
        &self.providers
    }

    /// The continuous derived-state stream. Survives individual operation
    /// failures; only dropping the api ends it.
    pub fn state(&self) -> watch::Receiver<DerivedState> {
        self.state_tx.subscribe()
    }

    /// Snapshot copy of the accumulated history.
    pub fn history(&self) -> Vec<TxHistoryEntry> {
        self.lock_history().clone()
    }

    /// Submit an "issue" call and wait for finalization. Returns the
    /// transaction hash; on failure the error is logged and rethrown
    /// unchanged, with nothing recorded.
    pub async fn issue_invoice(
        &self,
        amount: u64,
        invoice: &InvoiceData,
    ) -> std::result::Result<TxHash, TxError> {
        let invoice_json = serde_json::to_string(invoice)?;
        let submitted = self
            .binding
            .issue_invoice(&self.address, &self.secret, amount, &invoice_json)
            .await
            .map_err(|e| log_tx_error("issue", e))?;
        let finalized = submitted
            .finalized()
            .await
            .map_err(|e| log_tx_error("issue", e))?;

        info!(
            "Invoice issued for {amount} (tx {}, block {})",
            finalized.tx_hash, finalized.block_height
        );
        self.append(TxHistoryEntry {
            kind: TxKind::Issue,
            tx_hash: finalized.tx_hash.clone(),
            block_height: finalized.block_height,
            timestamp: chrono::Utc::now().timestamp(),
            amount: Some(amount),
            invoice_data: Some(invoice.clone()),
        });
        Ok(finalized.tx_hash)
    }

    /// Submit a "pay" call. Proof generation happens in the external proof
    /// provider; a proof failure is surfaced to the caller, never retried
    /// here.
    pub async fn pay_invoice(&self) -> std::result::Result<TxHash, TxError> {
        let submitted = self
            .binding
            .pay_invoice(&self.address, &self.secret)
            .await
            .map_err(|e| log_tx_error("pay", e))?;
        let finalized = submitted
            .finalized()
            .await
            .map_err(|e| log_tx_error("pay", e))?;

        info!(
            "Invoice paid (tx {}, block {})",
            finalized.tx_hash, finalized.block_height
        );
        self.append(TxHistoryEntry {
            kind: TxKind::Payment,
            tx_hash: finalized.tx_hash.clone(),
            block_height: finalized.block_height,
            timestamp: chrono::Utc::now().timestamp(),
            amount: None,
            invoice_data: None,
        });
        Ok(finalized.tx_hash)
    }

    /// Submit a "reset" call, returning the contract to EMPTY and bumping
    /// the sequence.
    pub async fn reset_invoice(&self) -> std::result::Result<TxHash, TxError> {
        let submitted = self
            .binding
            .reset_invoice(&self.address)
            .await
            .map_err(|e| log_tx_error("reset", e))?;
        let finalized = submitted
            .finalized()
            .await
            .map_err(|e| log_tx_error("reset", e))?;

        info!(
            "Invoice reset (tx {}, block {})",
            finalized.tx_hash, finalized.block_height
        );
        self.append(TxHistoryEntry {
            kind: TxKind::Reset,
            tx_hash: finalized.tx_hash.clone(),
            block_height: finalized.block_height,
            timestamp: chrono::Utc::now().timestamp(),
            amount: None,
            invoice_data: None,
        });
        Ok(finalized.tx_hash)
    }

    /// Recompute the derived view against one ledger projection.
    fn compose(&self, snapshot: &LedgerSnapshot) -> DerivedState {
        let expected = self
            .binding
            .derive_public_key(&self.secret, snapshot.sequence);
        // Opaque byte comparison of fixed-size commitments.
        let can_pay = expected == snapshot.buyer_pk;
        DerivedState {
            state: snapshot.state,
            sequence: snapshot.sequence,
            amount: snapshot.amount,
            invoice_data: parse_invoice(&snapshot.invoice_json),
            can_pay,
            tx_history: self.lock_history().clone(),
        }
    }

    fn append(&self, entry: TxHistoryEntry) {
        self.lock_history().push(entry);
        self.history_tick.send_modify(|n| *n += 1);
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<TxHistoryEntry>> {
        match self.history.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Recompute and publish on every ledger emission and on every history
/// append; latest raw state wins in either case.
async fn compose_loop(
    api: Weak<InvoiceApi>,
    mut raw_rx: watch::Receiver<RawLedgerState>,
    mut tick_rx: watch::Receiver<u64>,
) {
    loop {
        tokio::select! {
            changed = raw_rx.changed() => {
                if changed.is_err() {
                    debug!("Public state stream closed, composer stopping");
                    return;
                }
            }
            changed = tick_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                let _ = tick_rx.borrow_and_update();
            }
        }
        let Some(api) = api.upgrade() else { return };
        let raw = raw_rx.borrow_and_update().clone();
        let derived = api.compose(&api.binding.ledger(&raw));
        api.state_tx.send_replace(derived);
    }
}

/// Log with operation context and rethrow the error unchanged.
fn log_tx_error(op: &str, e: TxError) -> TxError {
    error!("Invoice {op} failed: {e}");
    e
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::sim_registry;

    fn sample_invoice() -> InvoiceData {
        InvoiceData {
            title: "T".to_string(),
            description: "D".to_string(),
            issued_at: "2025-01-01".to_string(),
            currency: "NIGHT".to_string(),
        }
    }

    async fn deployed_api() -> (Arc<InvoiceApi>, crate::sim::SimHandles) {
        let (registry, handles) = sim_registry();
        let api = registry.resolve(None).deployed().await.unwrap();
        (api, handles)
    }

    async fn snapshot_where<F>(rx: &mut watch::Receiver<DerivedState>, pred: F) -> DerivedState
    where
        F: Fn(&DerivedState) -> bool,
    {
        loop {
            {
                let current = rx.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            rx.changed().await.expect("derived state stream closed");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn issue_round_trips_invoice_data() {
        let (api, _handles) = deployed_api().await;
        let mut rx = api.state();
        let invoice = sample_invoice();

        api.issue_invoice(25_000, &invoice).await.unwrap();
        let snap = snapshot_where(&mut rx, |s| s.invoice_data.is_some()).await;
        assert_eq!(snap.state, InvoiceState::Issued);
        assert_eq!(snap.amount, 25_000);
        assert_eq!(snap.invoice_data, Some(invoice));
    }

    #[tokio::test(start_paused = true)]
    async fn can_pay_tracks_the_commitment_across_resets() {
        let (api, _handles) = deployed_api().await;
        let mut rx = api.state();

        // Nothing issued yet: no commitment to match.
        assert!(!rx.borrow().can_pay);

        api.issue_invoice(100, &sample_invoice()).await.unwrap();
        let snap = snapshot_where(&mut rx, |s| s.state == InvoiceState::Issued).await;
        assert!(snap.can_pay);

        api.pay_invoice().await.unwrap();
        api.reset_invoice().await.unwrap();

        // Reset bumped the sequence; the stale commitment no longer
        // matches the recomputed key.
        let snap = snapshot_where(&mut rx, |s| s.state == InvoiceState::Empty && s.sequence == 2)
            .await;
        assert!(!snap.can_pay);

        // Reissuing records a commitment for the new sequence.
        api.issue_invoice(50, &sample_invoice()).await.unwrap();
        let snap = snapshot_where(&mut rx, |s| s.state == InvoiceState::Issued).await;
        assert!(snap.can_pay);
    }

    #[tokio::test(start_paused = true)]
    async fn history_records_completion_order_with_network_facts() {
        let (api, _handles) = deployed_api().await;

        let issue_hash = api.issue_invoice(42, &sample_invoice()).await.unwrap();
        let pay_hash = api.pay_invoice().await.unwrap();
        let reset_hash = api.reset_invoice().await.unwrap();

        let history = api.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, TxKind::Issue);
        assert_eq!(history[0].tx_hash, issue_hash);
        assert_eq!(history[0].amount, Some(42));
        assert_eq!(history[1].kind, TxKind::Payment);
        assert_eq!(history[1].tx_hash, pay_hash);
        assert_eq!(history[2].kind, TxKind::Reset);
        assert_eq!(history[2].tx_hash, reset_hash);
        assert!(history[0].block_height < history[1].block_height);
        assert!(history[1].block_height < history[2].block_height);

        // The stream carries a snapshot copy of the same history.
        let mut rx = api.state();
        let snap = snapshot_where(&mut rx, |s| s.tx_history.len() == 3).await;
        assert_eq!(snap.tx_history, history);
    }

    #[tokio::test(start_paused = true)]
    async fn emitted_snapshots_are_immune_to_later_appends() {
        let (api, _handles) = deployed_api().await;
        let mut rx = api.state();

        api.issue_invoice(7, &sample_invoice()).await.unwrap();
        let after_issue = snapshot_where(&mut rx, |s| s.tx_history.len() == 1).await;

        api.pay_invoice().await.unwrap();
        snapshot_where(&mut rx, |s| s.tx_history.len() == 2).await;

        // The earlier snapshot still holds exactly one entry.
        assert_eq!(after_issue.tx_history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_operation_leaves_no_trace() {
        let (api, _handles) = deployed_api().await;

        // Paying an EMPTY contract violates the on-chain precondition.
        let err = api.pay_invoice().await.unwrap_err();
        assert!(matches!(err, TxError::Rejected(_)));
        assert!(api.history().is_empty());

        // The stream is still alive and usable afterwards.
        let mut rx = api.state();
        api.issue_invoice(5, &sample_invoice()).await.unwrap();
        let snap = snapshot_where(&mut rx, |s| s.state == InvoiceState::Issued).await;
        assert_eq!(snap.tx_history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn proof_failure_surfaces_without_retry() {
        let (api, handles) = deployed_api().await;
        api.issue_invoice(9, &sample_invoice()).await.unwrap();

        handles.prover.fail_next(true);
        let err = api.pay_invoice().await.unwrap_err();
        assert!(matches!(err, TxError::Proof(_)));
        assert_eq!(handles.prover.prove_calls(), 1);
        assert_eq!(api.history().len(), 1);

        // The caller decides to retry; nothing in the adapter does.
        handles.prover.fail_next(false);
        api.pay_invoice().await.unwrap();
        assert_eq!(api.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_ledger_invoice_is_absent_not_fatal() {
        let (api, handles) = deployed_api().await;
        let mut rx = api.state();

        api.issue_invoice(11, &sample_invoice()).await.unwrap();
        snapshot_where(&mut rx, |s| s.invoice_data.is_some()).await;

        let addr = api.address().clone();
        handles.network.corrupt_invoice_json(&addr, r#"{"title":"T","descr"#);

        let snap = snapshot_where(&mut rx, |s| s.invoice_data.is_none()).await;
        assert_eq!(snap.state, InvoiceState::Issued);
        assert_eq!(snap.amount, 11);
    }
}
