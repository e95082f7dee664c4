use crate::bundler::{BundlerClient, RpcTransport};
use crate::contracts::ChainApi;
use crate::encoding::user_op_to_estimation_json;
use crate::error::{Result, UserOpError};
use crate::types::{FeeEstimates, GasEstimates, UserOperation};
use ethers::types::{Address, U256};

/// `value * (100 + margin_percent) / 100`, floored.
///
/// Fails when the bundler hands back an estimate too large to scale.
pub fn with_margin(value: U256, margin_percent: u64) -> Result<U256> {
    let factor = 100u64
        .checked_add(margin_percent)
        .ok_or_else(|| UserOpError::estimation(format!("margin {margin_percent}% overflows")))?;
    value
        .checked_mul(U256::from(factor))
        .map(|v| v / U256::from(100u64))
        .ok_or_else(|| UserOpError::estimation(format!("gas estimate {value} overflows with margin")))
}

/// Asks the bundler for gas limits and returns them with the safety margin applied.
///
/// The request carries a dummy signature and leaves out `factory`/`factoryData`
/// once the account exists.
pub async fn estimate_operation_gas<T: RpcTransport>(
    bundler: &BundlerClient<T>,
    op: &UserOperation,
    entry_point: Address,
    margin_percent: u64,
) -> Result<GasEstimates> {
    let raw = bundler
        .estimate_user_operation_gas(user_op_to_estimation_json(op), entry_point)
        .await?;
    tracing::debug!(?raw, "bundler gas estimate");

    Ok(GasEstimates {
        pre_verification_gas: with_margin(raw.pre_verification_gas, margin_percent)?,
        call_gas_limit: with_margin(raw.call_gas_limit, margin_percent)?,
        verification_gas_limit: with_margin(raw.verification_gas_limit, margin_percent)?,
        paymaster_verification_gas_limit: raw
            .paymaster_verification_gas_limit
            .map(|v| with_margin(v, margin_percent))
            .transpose()?,
    })
}

/// Max fee from the node's fee data, priority fee from the bundler.
pub async fn estimate_fees<T, C>(bundler: &BundlerClient<T>, chain: &C) -> Result<FeeEstimates>
where
    T: RpcTransport,
    C: ChainApi + ?Sized,
{
    let max_fee_per_gas = chain.max_fee_per_gas().await?;
    let max_priority_fee_per_gas = bundler.max_priority_fee_per_gas().await?;
    Ok(FeeEstimates {
        max_fee_per_gas,
        max_priority_fee_per_gas,
    })
}

/// Writes estimates over the placeholders.
///
/// For sponsored operations `paymaster_override` wins over the bundler's
/// paymaster verification estimate when set. With neither, the placeholder stays.
pub fn apply_estimates(
    op: &mut UserOperation,
    gas: &GasEstimates,
    fees: &FeeEstimates,
    paymaster_override: Option<U256>,
) {
    op.pre_verification_gas = gas.pre_verification_gas;
    op.call_gas_limit = gas.call_gas_limit;
    op.verification_gas_limit = gas.verification_gas_limit;
    if op.is_sponsored() {
        if let Some(v) = paymaster_override.or(gas.paymaster_verification_gas_limit) {
            op.paymaster_verification_gas_limit = Some(v);
        }
    }
    op.max_fee_per_gas = fees.max_fee_per_gas;
    op.max_priority_fee_per_gas = fees.max_priority_fee_per_gas;
}
