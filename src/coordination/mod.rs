//! Relay coordination
//!
//! The coordinator:
//! 1. Consumes confirmed deposit logs from the source watcher
//! 2. Records deposits in the ledger and moves them through their lifecycle
//! 3. Runs fills on a bounded worker pool
//! 4. Advances the durable source cursor past fully confirmed blocks

pub mod cursor;
pub mod engine;
pub mod ledger;

pub use cursor::CursorStore;
pub use engine::{safe_height, CoordinatorConfig, RelayCoordinator, RelayState, RelayStatus};
pub use ledger::{DepositLedger, UpsertOutcome};
