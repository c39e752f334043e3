//! Indexer client — the HTTP implementation of [`PublicDataProvider`].
//!
//! Polls the indexer's JSON-RPC `getContractState` for each subscribed
//! address and republishes the raw state over a per-address watch channel,
//! so subscribers see at least one initial emission and then one per
//! confirmed change. A poll loop lives exactly as long as its subscribers:
//! when the last receiver drops the loop removes its map entry on the way
//! out, and a later subscribe for the same address starts a fresh one.
//!
//! ## Resilience
//!
//! * Exponential back-off when the RPC returns an error or rate-limit
//!   response, up to [`MAX_BACKOFF_SECS`] seconds; the retry fires as soon
//!   as the back-off sleep ends.
//! * Transient network errors are retried silently; the subscription
//!   channel keeps its last known state in the meantime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::contract::PublicDataProvider;
use crate::errors::{AdapterError, Result};
use crate::ledger::{ContractAddress, RawLedgerState};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<StateResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StateResult {
    /// Raw contract state as the indexer stores it; opaque here, projected
    /// by the contract binding.
    state: Value,
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

type SubscriptionMap = Arc<Mutex<HashMap<ContractAddress, watch::Sender<RawLedgerState>>>>;

/// One contract-state fetch, without retry. The subscription lifecycle is
/// driven through this seam so it can run against an in-memory source.
#[async_trait]
trait StateFetch: Send + Sync {
    async fn fetch(&self, address: &ContractAddress) -> Result<RawLedgerState>;
}

struct RpcFetch {
    client: Client,
    rpc_url: String,
}

#[async_trait]
impl StateFetch for RpcFetch {
    async fn fetch(&self, address: &ContractAddress) -> Result<RawLedgerState> {
        fetch_contract_state(&self.client, &self.rpc_url, address).await
    }
}

pub struct IndexerClient {
    fetch: Arc<dyn StateFetch>,
    poll_interval: Duration,
    subscriptions: SubscriptionMap,
}

impl IndexerClient {
    pub fn new(client: Client, rpc_url: &str, poll_interval: Duration) -> Self {
        IndexerClient {
            fetch: Arc::new(RpcFetch {
                client,
                rpc_url: rpc_url.to_string(),
            }),
            poll_interval,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl PublicDataProvider for IndexerClient {
    async fn subscribe(
        &self,
        address: &ContractAddress,
    ) -> Result<watch::Receiver<RawLedgerState>> {
        subscribe_state(
            self.fetch.clone(),
            self.subscriptions.clone(),
            address,
            self.poll_interval,
        )
        .await
    }
}

async fn subscribe_state(
    fetch: Arc<dyn StateFetch>,
    subscriptions: SubscriptionMap,
    address: &ContractAddress,
    poll_interval: Duration,
) -> Result<watch::Receiver<RawLedgerState>> {
    if let Some(sender) = lock_subscriptions(&subscriptions).get(address) {
        return Ok(sender.subscribe());
    }

    // First subscriber for this address: one successful fetch seeds the
    // channel before the poll loop takes over.
    let initial = fetch.fetch(address).await?;
    let rx = {
        let mut subs = lock_subscriptions(&subscriptions);
        // A concurrent first subscriber may have won the race during the
        // fetch above; its loop is already running.
        if let Some(sender) = subs.get(address) {
            return Ok(sender.subscribe());
        }
        let (tx, rx) = watch::channel(initial);
        subs.insert(address.clone(), tx.clone());

        let fetch = fetch.clone();
        let subscriptions = subscriptions.clone();
        let address = address.clone();
        tokio::spawn(async move {
            poll_loop(fetch, subscriptions, address, poll_interval, tx).await;
        });
        rx
    };

    Ok(rx)
}

/// Poll until every receiver for this address is gone, then drop the map
/// entry so the next subscribe starts over with a fresh fetch and loop.
async fn poll_loop(
    fetch: Arc<dyn StateFetch>,
    subscriptions: SubscriptionMap,
    address: ContractAddress,
    poll_interval: Duration,
    tx: watch::Sender<RawLedgerState>,
) {
    let mut backoff = INITIAL_BACKOFF_SECS;
    tokio::time::sleep(poll_interval).await;
    loop {
        {
            // Checked under the map lock: a concurrent re-subscribe either
            // reaches this sender before the removal or finds no entry and
            // spawns its own loop.
            let mut subs = lock_subscriptions(&subscriptions);
            if tx.is_closed() {
                subs.remove(&address);
                debug!("Last subscriber for {address} gone, poll loop stopping");
                return;
            }
        }

        match fetch.fetch(&address).await {
            Ok(state) => {
                backoff = INITIAL_BACKOFF_SECS;
                tx.send_if_modified(|current| {
                    if *current == state {
                        return false;
                    }
                    *current = state;
                    true
                });
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => {
                warn!("Contract state poll for {address} failed (retry in {backoff}s): {e}");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
            }
        }
    }
}

fn lock_subscriptions(
    subscriptions: &SubscriptionMap,
) -> std::sync::MutexGuard<'_, HashMap<ContractAddress, watch::Sender<RawLedgerState>>> {
    match subscriptions.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn fetch_contract_state(
    client: &Client,
    rpc_url: &str,
    address: &ContractAddress,
) -> Result<RawLedgerState> {
    let response = client
        .post(rpc_url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getContractState",
            "params": { "address": address.0 },
        }))
        .send()
        .await?;

    let body: RpcResponse = response.json().await?;
    if let Some(err) = body.error {
        return Err(AdapterError::Provider(format!(
            "indexer RPC error {}: {}",
            err.code, err.message
        )));
    }
    let result = body
        .result
        .ok_or_else(|| AdapterError::Provider("empty result from getContractState".to_string()))?;

    debug!("Fetched contract state for {address}");
    Ok(RawLedgerState(result.state))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Returns a distinct state on every call.
    #[derive(Default)]
    struct SeqFetch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StateFetch for SeqFetch {
        async fn fetch(&self, _address: &ContractAddress) -> Result<RawLedgerState> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(RawLedgerState(json!({ "sequence": n })))
        }
    }

    /// Succeeds, fails once, then succeeds with fresh states.
    #[derive(Default)]
    struct FlakyFetch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StateFetch for FlakyFetch {
        async fn fetch(&self, _address: &ContractAddress) -> Result<RawLedgerState> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 1 {
                return Err(AdapterError::Provider("indexer hiccup".to_string()));
            }
            Ok(RawLedgerState(json!({ "sequence": n })))
        }
    }

    fn empty_map() -> SubscriptionMap {
        Arc::new(Mutex::new(HashMap::new()))
    }

    #[test]
    fn response_with_result_parses() {
        let body = r#"{"result":{"state":{"state":"issued","sequence":3}},"error":null}"#;
        let parsed: RpcResponse = serde_json::from_str(body).unwrap();
        let result = parsed.result.unwrap();
        assert_eq!(
            result.state.get("state").and_then(|v| v.as_str()),
            Some("issued")
        );
        assert!(parsed.error.is_none());
    }

    #[test]
    fn response_with_error_parses() {
        let body = r#"{"result":null,"error":{"code":-32601,"message":"method not found"}}"#;
        let parsed: RpcResponse = serde_json::from_str(body).unwrap();
        let err = parsed.error.unwrap();
        assert_eq!(err.code, -32601);
        assert_eq!(err.message, "method not found");
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_after_teardown_gets_a_live_stream() {
        let fetch: Arc<dyn StateFetch> = Arc::new(SeqFetch::default());
        let subs = empty_map();
        let address = ContractAddress::random();
        let interval = Duration::from_millis(100);

        let rx = subscribe_state(fetch.clone(), subs.clone(), &address, interval)
            .await
            .unwrap();
        drop(rx);

        // The loop notices the dropped receiver and removes its entry.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(lock_subscriptions(&subs).is_empty());

        // A fresh subscription keeps delivering confirmed changes.
        let mut rx = subscribe_state(fetch, subs, &address, interval).await.unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().0.get("sequence").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_retries_after_the_backoff_alone() {
        let fetch: Arc<dyn StateFetch> = Arc::new(FlakyFetch::default());
        let subs = empty_map();
        let address = ContractAddress::random();
        let interval = Duration::from_millis(100);

        let start = tokio::time::Instant::now();
        let mut rx = subscribe_state(fetch, subs, &address, interval).await.unwrap();
        rx.changed().await.unwrap();

        // One poll interval, one failed fetch, one back-off sleep; no extra
        // interval between the back-off and the retry.
        assert_eq!(
            start.elapsed(),
            interval + Duration::from_secs(INITIAL_BACKOFF_SECS)
        );
    }
}
