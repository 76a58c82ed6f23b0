//! Transaction signing

use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use tracing::info;

/// Env var holding the relayer key when none is configured
pub const DEFAULT_KEY_ENV: &str = "RELAYER_PRIVATE_KEY";

/// Signs fill transactions for the relayer account
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    /// RLP encoding of `tx` with its signature, ready for broadcast
    async fn sign(&self, tx: &TypedTransaction) -> RelayerResult<Bytes>;
}

/// Signer backed by a hex private key
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(private_key: &str, chain_id: u64) -> RelayerResult<Self> {
        let wallet = private_key
            .trim()
            .parse::<LocalWallet>()
            .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        Ok(Self { wallet })
    }

    /// Load the key from the environment variable `var`
    pub fn from_env(var: &str, chain_id: u64) -> RelayerResult<Self> {
        let key = std::env::var(var).map_err(|_| {
            RelayerError::Wallet(format!("No wallet configured. Set {}", var))
        })?;
        let signer = Self::new(&key, chain_id)?;

        info!("Relayer wallet loaded: {:?}", signer.address());
        Ok(signer)
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    // Well-known development key
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn test_wallet_address() {
        let signer = WalletSigner::new(DEV_KEY, 31337).unwrap();
        assert_eq!(
            signer.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_key() {
        assert!(matches!(
            WalletSigner::new("not-a-key", 1),
            Err(RelayerError::Wallet(_))
        ));
    }

    #[tokio::test]
    async fn test_sign_produces_raw_transaction() {
        let signer = WalletSigner::new(DEV_KEY, 31337).unwrap();
        let tx: TypedTransaction = TransactionRequest::new()
            .to(Address::repeat_byte(1))
            .nonce(0u64)
            .gas(21_000u64)
            .gas_price(1u64)
            .chain_id(31337u64)
            .into();

        let raw = signer.sign(&tx).await.unwrap();
        assert!(raw.len() > tx.rlp().len());
    }
}
