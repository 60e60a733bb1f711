//! Mock Ledger Backend for Testing
//!
//! Fully in-memory [`Ledger`] implementation. No network calls, no
//! randomness: every response is determined by state set through the
//! testing helpers.
//!
//! # Features
//!
//! - Settable balances, pool balance and sale status
//! - Per-address read-failure injection
//! - Counted failures for pool and sale status reads
//! - Queued disbursement failures (consumed FIFO)
//! - Successful disbursements debit the pool and are recorded
//! - `emit_transfer` fans a transfer out to every live subscription
//!
//! # Example
//!
//! ```ignore
//! let ledger = MockLedger::new();
//! ledger.set_balance(addr, 1_000);
//! ledger.set_pool(500);
//! assert_eq!(ledger.balance_of(&addr).await?, 1_000);
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use futures::stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::address::Address;
use crate::ledger::{Ledger, LedgerError, TransferEvent, TransferStream, TxReceipt};

/// Capacity of the transfer fan-out channel.
const TRANSFER_CHANNEL_CAPACITY: usize = 1024;

// ════════════════════════════════════════════════════════════════════════════════
// MOCK LEDGER
// ════════════════════════════════════════════════════════════════════════════════

/// A disbursement accepted by the mock ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDisbursement {
    /// Recipients in submission order.
    pub addresses: Vec<Address>,
    /// Amounts, parallel to `addresses`.
    pub amounts: Vec<u128>,
}

impl RecordedDisbursement {
    /// Sum of all amounts in this disbursement.
    #[must_use]
    pub fn total(&self) -> u128 {
        self.amounts.iter().sum()
    }
}

/// In-memory ledger for tests and dry runs.
pub struct MockLedger {
    balances: RwLock<HashMap<Address, u128>>,
    pool: Mutex<u128>,
    sale_ended: RwLock<bool>,
    sale_end_time: RwLock<u64>,
    failing_reads: RwLock<HashSet<Address>>,
    status_failures: Mutex<u32>,
    disburse_failures: Mutex<VecDeque<LedgerError>>,
    disbursements: Mutex<Vec<RecordedDisbursement>>,
    next_tx: Mutex<u64>,
    transfers: broadcast::Sender<TransferEvent>,
}

impl std::fmt::Debug for MockLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLedger")
            .field("accounts", &self.balances.read().len())
            .field("pool", &*self.pool.lock())
            .field("sale_ended", &*self.sale_ended.read())
            .field("disbursements", &self.disbursements.lock().len())
            .finish()
    }
}

impl MockLedger {
    /// Creates an empty ledger: no balances, empty pool, sale ended at t=0.
    #[must_use]
    pub fn new() -> Self {
        let (transfers, _) = broadcast::channel(TRANSFER_CHANNEL_CAPACITY);
        Self {
            balances: RwLock::new(HashMap::new()),
            pool: Mutex::new(0),
            sale_ended: RwLock::new(true),
            sale_end_time: RwLock::new(0),
            failing_reads: RwLock::new(HashSet::new()),
            status_failures: Mutex::new(0),
            disburse_failures: Mutex::new(VecDeque::new()),
            disbursements: Mutex::new(Vec::new()),
            next_tx: Mutex::new(1),
            transfers,
        }
    }
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTING HELPERS
// ════════════════════════════════════════════════════════════════════════════════

impl MockLedger {
    /// Sets the token balance of `address`.
    pub fn set_balance(&self, address: Address, balance: u128) {
        self.balances.write().insert(address, balance);
    }

    /// Sets the payout pool balance.
    pub fn set_pool(&self, amount: u128) {
        *self.pool.lock() = amount;
    }

    /// Current pool balance (after any successful disbursements).
    #[must_use]
    pub fn pool(&self) -> u128 {
        *self.pool.lock()
    }

    /// Sets sale status and end time.
    pub fn set_sale(&self, ended: bool, end_time: u64) {
        *self.sale_ended.write() = ended;
        *self.sale_end_time.write() = end_time;
    }

    /// Makes `balance_of(address)` fail until cleared.
    pub fn fail_reads_for(&self, address: Address) {
        self.failing_reads.write().insert(address);
    }

    /// Clears read-failure injection for `address`.
    pub fn clear_read_failure(&self, address: &Address) {
        self.failing_reads.write().remove(address);
    }

    /// Makes the next `count` pool or sale status reads fail.
    pub fn fail_status_reads(&self, count: u32) {
        *self.status_failures.lock() = count;
    }

    fn take_status_failure(&self, what: &str) -> Result<(), LedgerError> {
        let mut remaining = self.status_failures.lock();
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(LedgerError::Network(format!("injected {} read failure", what)))
    }

    /// Queues an error for the next `disburse` call.
    pub fn push_disburse_failure(&self, error: LedgerError) {
        self.disburse_failures.lock().push_back(error);
    }

    /// All successful disbursements, in submission order.
    #[must_use]
    pub fn disbursements(&self) -> Vec<RecordedDisbursement> {
        self.disbursements.lock().clone()
    }

    /// Total paid across all successful disbursements.
    #[must_use]
    pub fn total_disbursed(&self) -> u128 {
        self.disbursements.lock().iter().map(RecordedDisbursement::total).sum()
    }

    /// Broadcasts a transfer to every live subscription.
    ///
    /// Balances are NOT adjusted; tests set balances explicitly.
    /// Returns the number of subscribers that received the event.
    pub fn emit_transfer(&self, event: TransferEvent) -> usize {
        self.transfers.send(event).unwrap_or(0)
    }

    /// Number of live transfer subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.transfers.receiver_count()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// LEDGER IMPL
// ════════════════════════════════════════════════════════════════════════════════

#[async_trait]
impl Ledger for MockLedger {
    async fn balance_of(&self, address: &Address) -> Result<u128, LedgerError> {
        if self.failing_reads.read().contains(address) {
            return Err(LedgerError::Network(format!("injected read failure for {}", address)));
        }
        Ok(self.balances.read().get(address).copied().unwrap_or(0))
    }

    async fn pool_balance(&self) -> Result<u128, LedgerError> {
        self.take_status_failure("pool")?;
        Ok(*self.pool.lock())
    }

    async fn is_sale_ended(&self) -> Result<bool, LedgerError> {
        self.take_status_failure("sale status")?;
        Ok(*self.sale_ended.read())
    }

    async fn sale_end_time(&self) -> Result<u64, LedgerError> {
        self.take_status_failure("sale end time")?;
        Ok(*self.sale_end_time.read())
    }

    async fn disburse(
        &self,
        addresses: &[Address],
        amounts: &[u128],
    ) -> Result<TxReceipt, LedgerError> {
        if addresses.len() != amounts.len() {
            return Err(LedgerError::InvalidRequest(format!(
                "addresses ({}) and amounts ({}) differ in length",
                addresses.len(),
                amounts.len()
            )));
        }

        if let Some(err) = self.disburse_failures.lock().pop_front() {
            warn!(recipients = addresses.len(), "MockLedger: injected disbursement failure");
            return Err(err);
        }

        let total: u128 = amounts.iter().sum();
        {
            let mut pool = self.pool.lock();
            if total > *pool {
                return Err(LedgerError::Reverted {
                    tx_hash: format!("0xmock-insufficient-{}", total),
                });
            }
            *pool -= total;
        }

        self.disbursements.lock().push(RecordedDisbursement {
            addresses: addresses.to_vec(),
            amounts: amounts.to_vec(),
        });

        let tx_no = {
            let mut next = self.next_tx.lock();
            let n = *next;
            *next += 1;
            n
        };

        debug!(recipients = addresses.len(), total, "MockLedger: disbursement accepted");

        Ok(TxReceipt {
            tx_hash: format!("0x{:064x}", tx_no),
            block_number: Some(tx_no),
        })
    }

    fn subscribe_transfers(&self) -> TransferStream {
        let rx = self.transfers.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "MockLedger: transfer subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
