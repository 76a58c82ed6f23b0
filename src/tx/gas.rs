//! Gas estimation and replacement pricing

use crate::chain::{DestinationChain, GasPrice};
use crate::config::FillConfig;
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::debug;

/// Gas estimator for fill transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
    /// Increase applied to each same-nonce replacement
    bump_percent: u64,
}

impl GasEstimator {
    pub fn new(config: &FillConfig) -> Self {
        Self {
            gas_limit_buffer_percent: config.gas_limit_buffer_percent,
            gas_price_buffer_percent: config.gas_price_buffer_percent,
            bump_percent: config.gas_bump_percent,
        }
    }

    /// Node estimate for `tx` plus the limit buffer
    pub async fn estimate_fill_gas(
        &self,
        chain: &dyn DestinationChain,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = chain.estimate_gas(tx).await?;
        let buffer = estimate * self.gas_limit_buffer_percent / 100;
        Ok(estimate + buffer)
    }

    /// Current price on the chain plus the price buffer
    pub async fn get_gas_price(&self, chain: &dyn DestinationChain) -> RelayerResult<GasPrice> {
        let gas_price = chain.gas_price().await?;
        let buffered = scale(&gas_price, 100 + self.gas_price_buffer_percent);

        debug!("Gas price for chain {}: {:?}", chain.chain_id(), buffered);
        Ok(buffered)
    }

    /// Price for the `replacements`-th same-nonce replacement of `base`
    pub fn bumped(&self, base: &GasPrice, replacements: u32) -> GasPrice {
        (0..replacements).fold(base.clone(), |price, _| {
            scale(&price, 100 + self.bump_percent)
        })
    }
}

fn scale(price: &GasPrice, percent: u64) -> GasPrice {
    match price {
        GasPrice::Legacy(price) => GasPrice::Legacy(*price * percent / 100),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => GasPrice::Eip1559 {
            max_fee_per_gas: *max_fee_per_gas * percent / 100,
            max_priority_fee_per_gas: *max_priority_fee_per_gas * percent / 100,
        },
    }
}
