//! # GEN Dividend Cycle Engine
//!
//! Runs an endless sequence of time-boxed dividend cycles for GEN holders.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           CycleManager                                │
//! │                                                                       │
//! │   ┌─────────────────┐   ┌───────────────┐   ┌─────────────────────┐  │
//! │   │ SnapshotBuilder │──▶│ CycleMonitor  │──▶│ PayoutCalculator    │  │
//! │   │ (new Cycle)     │   │ (timer +      │   │ (progress, amounts) │  │
//! │   └────────┬────────┘   │  transfers)   │   └──────────┬──────────┘  │
//! │            │            └───────┬───────┘              │             │
//! │            │                    │                      ▼             │
//! │            │                    │           ┌─────────────────────┐  │
//! │            │                    │           │ BatchDisburser      │  │
//! │            │                    │           │ (scale, chunk, pay) │  │
//! │            │                    │           └──────────┬──────────┘  │
//! └────────────┼────────────────────┼──────────────────────┼─────────────┘
//!              ▼                    ▼                      ▼
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                         StateStore                           │
//!     │ verifier-state.json · cycle-metadata.json · cycle-payout.json│
//!     └──────────────────────────────────────────────────────────────┘
//!              ▲
//!     HolderRegistry (dividend-users.json, read-only)
//! ```
//!
//! All ledger access goes through `Arc<dyn gen_common::Ledger>`.
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `types` | Persisted records |
//! | `store` | JSON-file state store |
//! | `registry` | Holder registry access |
//! | `snapshot` | Cycle creation |
//! | `monitor` | Re-verification during the payout window |
//! | `payout` | Progress and payout amounts |
//! | `disburse` | Pool-constrained batched disbursement |
//! | `manager` | Lifecycle state machine |
//! | `status` | Read-only state summary |
//! | `config` | Parameters and env loading |
//! | `clock` | Time sources |

pub mod clock;
pub mod config;
pub mod disburse;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod payout;
pub mod registry;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{DividendConfig, EngineParams, HOUR_SECS};
pub use disburse::{pack_chunk, scale_to_pool, BatchDisburser, DisbursementReport, PackedChunk};
pub use error::CycleError;
pub use manager::{CycleManager, CyclePhase, CycleSummary};
pub use monitor::{CycleFlags, CycleMonitor, PassReport, WatchOutcome};
pub use payout::{
    evaluate_holder, payout_amount, progress_for, PayoutCalculator, PayoutDecision, PayoutPlan,
};
pub use registry::{HolderRegistry, JsonFileRegistry, StaticRegistry, REGISTRY_FILENAME};
pub use snapshot::{classify, HolderDecision, SnapshotBuilder};
pub use status::StatusReport;
pub use store::{StateStore, StoreError};
pub use types::{
    Cycle, CycleStatus, HolderVerifierRecord, Payout, PayoutLogEntry, SnapshotEntry, Telemetry,
    VerifierState,
};
