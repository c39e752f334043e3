//! Reactive adapter between a privacy-preserving invoice contract and its
//! UI: wallet-connector bootstrap, provider bundle assembly, an observable
//! deployment registry, and a derived-state composition pipeline fusing
//! public ledger state with locally held secret material.
//!
//! The contract circuits, the browser wallet, and the network services are
//! external collaborators behind the traits in [`contract`]; `sim` carries
//! a full in-process stand-in for all of them.

pub mod api;
pub mod config;
pub mod contract;
pub mod db;
pub mod errors;
pub mod indexer;
pub mod ledger;
pub mod proof;
pub mod providers;
pub mod registry;
pub mod sim;
pub mod wallet;

pub use api::{DerivedState, InvoiceApi, TxHistoryEntry, TxKind};
pub use config::Config;
pub use errors::{AdapterError, ConnectorError, TxError};
pub use ledger::{ContractAddress, InvoiceData, InvoiceState, LedgerSnapshot, TxHash};
pub use providers::{ProviderHub, Providers};
pub use registry::{Deployment, DeploymentStatus, Registry};
