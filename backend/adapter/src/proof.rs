//! HTTP proof-server and zk-artifact collaborators, accessed by URL only.
//!
//! The prover performs the actual zero-knowledge work; this crate ships the
//! transaction over, waits, and hands the proven payload back. Artifact
//! fetches are plain GETs keyed by circuit name.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::contract::{ProofProvider, ProvenTx, UnprovenTx, ZkConfigProvider};
use crate::errors::{AdapterError, Result, TxError};

pub struct HttpProofProvider {
    client: Client,
    base_url: String,
}

impl HttpProofProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        HttpProofProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProveResponse {
    tx: serde_json::Value,
}

#[async_trait]
impl ProofProvider for HttpProofProvider {
    async fn prove(&self, tx: UnprovenTx) -> std::result::Result<ProvenTx, TxError> {
        let url = format!("{}/prove-tx", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "tx": tx.0 }))
            .send()
            .await
            .map_err(|e| TxError::Proof(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TxError::Proof(format!(
                "prover returned {}",
                response.status()
            )));
        }
        let body: ProveResponse = response
            .json()
            .await
            .map_err(|e| TxError::Proof(e.to_string()))?;
        debug!("Proof generated via {url}");
        Ok(ProvenTx(body.tx))
    }
}

pub struct HttpZkConfigProvider {
    client: Client,
    base_url: String,
}

impl HttpZkConfigProvider {
    pub fn new(client: Client, base_url: &str) -> Self {
        HttpZkConfigProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ZkConfigProvider for HttpZkConfigProvider {
    async fn fetch_artifact(&self, circuit: &str) -> Result<Vec<u8>> {
        let url = format!("{}/artifacts/{circuit}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AdapterError::Provider(format!(
                "artifact fetch for {circuit} returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let provider = HttpProofProvider::new(Client::new(), "http://127.0.0.1:6300/");
        assert_eq!(provider.base_url, "http://127.0.0.1:6300");
    }

    #[test]
    fn prove_response_parses() {
        let body = r#"{"tx":{"circuit":"pay_invoice","proof":"00ff"}}"#;
        let parsed: ProveResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.tx.get("circuit").and_then(|v| v.as_str()),
            Some("pay_invoice")
        );
    }
}
