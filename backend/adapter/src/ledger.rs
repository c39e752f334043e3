//! Canonical domain types shared between the ledger projection and the
//! derived-state pipeline.
//!
//! [`LedgerSnapshot`] is the public on-chain projection of the invoice
//! contract; it is mutated only by confirmed transactions and read-only to
//! this crate. [`InvoiceData`] is the structured payload carried inside the
//! snapshot's `invoice_json` field.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// On-chain invoice lifecycle. Transitions are enforced by the contract:
/// EMPTY → ISSUED (issue) → PAID (pay) → EMPTY (reset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceState {
    #[default]
    Empty,
    Issued,
    Paid,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Issued => "issued",
            Self::Paid => "paid",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Self::Empty),
            "issued" => Some(Self::Issued),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

/// Address of a deployed contract instance (hex Strkey-like identifier).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractAddress(pub String);

impl ContractAddress {
    /// Mint a fresh address for a new deployment.
    pub fn random() -> Self {
        ContractAddress(hex::encode(rand::random::<[u8; 32]>()))
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of a submitted transaction, printable hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally held secret material. Never transmitted; only ever hashed
/// together with the current sequence to recompute the buyer commitment.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl SecretKey {
    pub fn generate() -> Self {
        SecretKey(rand::random())
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(SecretKey)
    }
}

// Redacted: secrets must not leak into logs.
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Opaque raw contract state as delivered by the public-data provider.
/// Only a [`crate::contract::ContractBinding`] knows how to project it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLedgerState(pub serde_json::Value);

/// The public, on-chain projection of the invoice contract.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub state: InvoiceState,
    /// Monotonically incremented by each reset; salts the buyer commitment.
    pub sequence: u64,
    pub amount: u64,
    /// Commitment `hash(buyer_secret, sequence)` recorded at issue time.
    pub buyer_pk: [u8; 32],
    /// Serialized invoice payload; empty string when no invoice is issued.
    pub invoice_json: String,
}

/// Structured invoice payload carried on-chain as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceData {
    pub title: String,
    pub description: String,
    #[serde(rename = "issuedAt")]
    pub issued_at: String,
    pub currency: String,
}

/// Parse the on-chain invoice JSON. An empty string means "no invoice";
/// malformed JSON is logged and treated the same way, never surfaced as an
/// error to stream subscribers.
pub fn parse_invoice(invoice_json: &str) -> Option<InvoiceData> {
    if invoice_json.is_empty() {
        return None;
    }
    match serde_json::from_str::<InvoiceData>(invoice_json) {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Ignoring malformed invoice payload on ledger: {e}");
            None
        }
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_state_round_trip() {
        for state in [InvoiceState::Empty, InvoiceState::Issued, InvoiceState::Paid] {
            assert_eq!(InvoiceState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(InvoiceState::from_str("settled"), None);
    }

    #[test]
    fn parse_invoice_round_trip() {
        let data = InvoiceData {
            title: "T".to_string(),
            description: "D".to_string(),
            issued_at: "2025-01-01".to_string(),
            currency: "NIGHT".to_string(),
        };
        let json = serde_json::to_string(&data).unwrap();
        assert_eq!(parse_invoice(&json), Some(data));
    }

    #[test]
    fn parse_invoice_empty_is_none() {
        assert_eq!(parse_invoice(""), None);
    }

    #[test]
    fn parse_invoice_truncated_is_none() {
        assert_eq!(parse_invoice(r#"{"title":"T","descr"#), None);
    }

    #[test]
    fn parse_invoice_wrong_shape_is_none() {
        assert_eq!(parse_invoice(r#"{"unexpected":true}"#), None);
    }

    #[test]
    fn fresh_addresses_are_distinct() {
        assert_ne!(ContractAddress::random(), ContractAddress::random());
    }

    #[test]
    fn secret_key_debug_is_redacted() {
        let key = SecretKey::generate();
        assert_eq!(format!("{key:?}"), "SecretKey(..)");
    }
}
