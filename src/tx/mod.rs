//! Fill transaction submission with nonce management and gas pricing

mod gas;
mod nonce;
mod signer;
mod submitter;

pub use gas::GasEstimator;
pub use nonce::NonceManager;
pub use signer::{TxSigner, WalletSigner, DEFAULT_KEY_ENV};
pub use submitter::{encode_fill_call, FillSubmitter, SubmitterConfig, FILL_DEPOSIT_SIGNATURE};
