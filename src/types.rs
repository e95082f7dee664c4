use ethers::types::{Address, Bytes, U256};

/// ERC-4337 UserOperation in the expanded (RPC) form used by EntryPoint v0.7.
///
/// `factory`/`factory_data` are `Some` only while the sender account is not yet
/// deployed. `init_code` is the legacy `factory || factoryData` concatenation and
/// is emptied together with them once code exists at `sender`.
///
/// The paymaster gas limits are `Option` so "not applicable" is distinct from a
/// zero limit; `paymaster_and_data` only packs when both are present.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub factory: Option<Address>,
    pub factory_data: Option<Bytes>,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster: Option<Address>,
    pub paymaster_verification_gas_limit: Option<U256>,
    pub paymaster_post_op_gas_limit: Option<U256>,
    pub paymaster_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Drops every piece of initialization data. Used once the sender already
    /// has code, since the entry point rejects initCode for existing accounts.
    pub fn clear_init(&mut self) {
        self.factory = None;
        self.factory_data = None;
        self.init_code = Bytes::default();
    }

    pub fn is_sponsored(&self) -> bool {
        matches!(self.paymaster, Some(pm) if !pm.is_zero())
    }
}

/// EntryPoint v0.7 `PackedUserOperation` (the on-chain struct layout).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackedUserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub account_gas_limits: [u8; 32],
    pub pre_verification_gas: U256,
    pub gas_fees: [u8; 32],
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl PackedUserOperation {
    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))` and `Paymaster.getHash((...), ..)`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        [u8; 32],
        U256,
        [u8; 32],
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.account_gas_limits,
            self.pre_verification_gas,
            self.gas_fees,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }
}

/// What a caller asks for. Everything else is filled in by the builder.
#[derive(Clone, Debug, Default)]
pub struct SimpleUserOperation {
    pub call_data: Bytes,
    pub paymaster: Option<Address>,
    pub paymaster_data: Bytes,
}

impl SimpleUserOperation {
    /// Sponsorship is requested only for a real (non-zero) paymaster address.
    pub fn wants_sponsorship(&self) -> bool {
        matches!(self.paymaster, Some(pm) if !pm.is_zero())
    }
}

/// Gas limits returned by `eth_estimateUserOperationGas`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GasEstimates {
    pub pre_verification_gas: U256,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub paymaster_verification_gas_limit: Option<U256>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeEstimates {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Off-chain paymaster approval for one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaymasterAuthorization {
    pub signature: Bytes,
    pub valid_after: u64,
    pub valid_until: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_init_drops_factory_fields() {
        let mut op = UserOperation {
            factory: Some(Address::repeat_byte(0xfa)),
            factory_data: Some(Bytes::from(vec![1, 2, 3])),
            init_code: Bytes::from(vec![0xfa; 23]),
            ..Default::default()
        };
        op.clear_init();
        assert_eq!(op.factory, None);
        assert_eq!(op.factory_data, None);
        assert!(op.init_code.is_empty());
    }

    #[test]
    fn zero_paymaster_is_not_sponsorship() {
        let simple = SimpleUserOperation {
            paymaster: Some(Address::zero()),
            ..Default::default()
        };
        assert!(!simple.wants_sponsorship());

        let simple = SimpleUserOperation {
            paymaster: Some(Address::repeat_byte(0x11)),
            ..Default::default()
        };
        assert!(simple.wants_sponsorship());
        assert!(!SimpleUserOperation::default().wants_sponsorship());
    }
}
