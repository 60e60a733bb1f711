//! # GEN Common Crate
//!
//! Shared building blocks for the GEN off-chain bots.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `address` | 20-byte [`Address`] type, decimal-string amount serde |
//! | `ledger` | [`Ledger`] capability trait, [`LedgerError`], transfer stream |
//! | `mock_ledger` | In-memory [`MockLedger`] for tests and dry runs |
//! | `evm_ledger` | JSON-RPC [`EvmLedger`] backend |
//! | `abi` | Minimal Solidity ABI encoding |
//! | `config` | [`LedgerConfig`] and env parsing helpers |
//!
//! ## Design
//!
//! Bots depend on `Arc<dyn Ledger>` only. Which backend is used is decided
//! once at start-up by the binary.

pub mod abi;
pub mod address;
pub mod config;
pub mod evm_ledger;
pub mod ledger;
pub mod mock_ledger;

pub use address::{amount_str, Address, AddressError};
pub use config::{env_parse_or, ConfigError, ContractMethods, LedgerConfig};
pub use evm_ledger::EvmLedger;
pub use ledger::{Ledger, LedgerError, TransferEvent, TransferStream, TxReceipt};
pub use mock_ledger::{MockLedger, RecordedDisbursement};
