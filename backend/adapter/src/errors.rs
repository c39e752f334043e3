//! Application-wide error types.
//!
//! Three layers, matching how failures propagate:
//!
//! * [`ConnectorError`] — wallet discovery/authorization failures, each a
//!   distinct user-facing message; never retried automatically.
//! * [`TxError`] — a single issue/pay/reset call failed; logged and rethrown
//!   to the immediate caller, history untouched.
//! * [`AdapterError`] — umbrella for "this whole deployment attempt failed";
//!   stored as a terminal value on the deployment, never thrown across the
//!   stream boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Wallet connector not found within {0} ms")]
    NotFound(u64),

    #[error("Wallet connector did not respond to the enable check")]
    Unresponsive,

    #[error("Wallet connector API version {found} does not satisfy required {required}")]
    VersionMismatch { required: String, found: String },

    #[error("Wallet connector authorization was rejected")]
    NotAuthorized,

    #[error("Wallet connector call failed: {0}")]
    Connector(String),
}

#[derive(Debug, Error)]
pub enum TxError {
    #[error("Invoice serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Transaction submission failed: {0}")]
    Submit(String),

    #[error("Transaction rejected by the network: {0}")]
    Rejected(String),

    #[error("Proof generation failed: {0}")]
    Proof(String),

    #[error("Transaction finalization failed: {0}")]
    Finalization(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("Transaction error: {0}")]
    Tx(#[from] TxError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider bundle error: {0}")]
    Provider(String),

    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Unknown contract address: {0}")]
    UnknownContract(String),

    #[error("Private state error: {0}")]
    PrivateState(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
