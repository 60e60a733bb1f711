//! # Ledger Capability
//!
//! Abstract interface to the external ledger used by every bot: balance and
//! pool queries, sale status, transfer notifications and batched
//! disbursement transactions.
//!
//! ## Backends
//!
//! | Backend | Module | Purpose |
//! |---------|--------|---------|
//! | [`MockLedger`](crate::MockLedger) | `mock_ledger` | In-memory with failure injection |
//! | [`EvmLedger`](crate::EvmLedger) | `evm_ledger` | JSON-RPC against an EVM node |
//!
//! ## Contract
//!
//! - Implementations MUST NOT retry internally. Retry belongs to the
//!   caller's scheduling (the next monitor pass, the next cycle).
//! - `disburse` MUST only return `Ok` once the transaction is confirmed
//!   successful. A reverted or unconfirmed transaction is an error.
//! - Dropping a [`TransferStream`] detaches the subscription.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::address::Address;

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Errors returned by ledger backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// Transport-level failure (connection refused, DNS, TLS).
    #[error("ledger network error: {0}")]
    Network(String),

    /// The node answered with a JSON-RPC error object.
    #[error("ledger rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Error message reported by the node.
        message: String,
    },

    /// Request or confirmation wait exceeded its budget.
    #[error("ledger request timed out")]
    Timeout,

    /// Response could not be decoded.
    #[error("ledger decode error: {0}")]
    Decode(String),

    /// Transaction was mined but reverted.
    #[error("transaction reverted: {tx_hash}")]
    Reverted {
        /// Hash of the reverted transaction.
        tx_hash: String,
    },

    /// The caller passed an unusable request (e.g. mismatched batch lengths).
    #[error("invalid ledger request: {0}")]
    InvalidRequest(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// EVENTS & RECEIPTS
// ════════════════════════════════════════════════════════════════════════════════

/// A token transfer observed on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount transferred, in base units.
    pub value: u128,
}

impl TransferEvent {
    /// Returns `true` if either side of the transfer satisfies `pred`.
    pub fn touches(&self, mut pred: impl FnMut(&Address) -> bool) -> bool {
        pred(&self.from) || pred(&self.to)
    }
}

/// Confirmation of a successful disbursement transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction hash (hex, `0x`-prefixed).
    pub tx_hash: String,
    /// Block the transaction was included in, when known.
    pub block_number: Option<u64>,
}

/// Stream of transfer notifications. Dropping it unsubscribes.
pub type TransferStream = Pin<Box<dyn Stream<Item = Result<TransferEvent, LedgerError>> + Send>>;

// ════════════════════════════════════════════════════════════════════════════════
// TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// Async ledger capability shared across bot components as `Arc<dyn Ledger>`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current token balance of `address`.
    async fn balance_of(&self, address: &Address) -> Result<u128, LedgerError>;

    /// Current balance of the dividend payout pool.
    async fn pool_balance(&self) -> Result<u128, LedgerError>;

    /// Whether the token sale has concluded.
    async fn is_sale_ended(&self) -> Result<bool, LedgerError>;

    /// Sale end time in epoch seconds.
    async fn sale_end_time(&self) -> Result<u64, LedgerError>;

    /// Pays `amounts[i]` to `addresses[i]` in one transaction.
    ///
    /// Returns only after the transaction is confirmed successful.
    async fn disburse(
        &self,
        addresses: &[Address],
        amounts: &[u128],
    ) -> Result<TxReceipt, LedgerError>;

    /// Subscribes to token transfer notifications.
    fn subscribe_transfers(&self) -> TransferStream;
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_touches_either_side() {
        let a = Address([0x01; 20]);
        let b = Address([0x02; 20]);
        let c = Address([0x03; 20]);
        let ev = TransferEvent { from: a, to: b, value: 1 };

        assert!(ev.touches(|x| *x == a));
        assert!(ev.touches(|x| *x == b));
        assert!(!ev.touches(|x| *x == c));
    }

    #[test]
    fn error_display() {
        let e = LedgerError::Rpc { code: -32000, message: "execution reverted".into() };
        assert_eq!(e.to_string(), "ledger rpc error -32000: execution reverted");
        assert!(LedgerError::Timeout.to_string().contains("timed out"));
    }
}
