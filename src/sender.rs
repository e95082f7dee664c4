use crate::contracts::{factory_data, ChainApi, EntryPointApi};
use crate::error::{Result, UserOpError};
use ethers::types::{Address, Bytes, H256};

/// Deployment payload for a counterfactual account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitCode {
    pub factory: Address,
    pub factory_data: Bytes,
}

impl InitCode {
    pub fn new(factory: Address, owner: Address, salt: H256, entry_point: Address) -> Result<Self> {
        Ok(Self {
            factory,
            factory_data: factory_data(owner, salt, entry_point)?,
        })
    }

    /// Legacy `initCode`: `factory || factoryData`.
    pub fn to_bytes(&self) -> Bytes {
        let mut v = Vec::with_capacity(20 + self.factory_data.len());
        v.extend_from_slice(self.factory.as_bytes());
        v.extend_from_slice(self.factory_data.as_ref());
        Bytes::from(v)
    }
}

/// `factory || createAccount(owner, salt, entryPoint)`.
pub fn build_init_code(
    factory: Address,
    owner: Address,
    salt: H256,
    entry_point: Address,
) -> Result<Bytes> {
    Ok(InitCode::new(factory, owner, salt, entry_point)?.to_bytes())
}

/// Reads the address out of a `SenderAddressResult(address)` revert.
///
/// The address is the trailing 20 bytes. Anything shorter than a selector plus
/// an address cannot carry one, and a zero address means the factory failed.
pub fn sender_from_revert(data: &Bytes) -> Result<Address> {
    const MIN_LEN: usize = 4 + 20;
    if data.len() < MIN_LEN {
        return Err(UserOpError::MalformedRevert {
            function: "getSenderAddress".into(),
            data: data.clone(),
        });
    }
    let sender = Address::from_slice(&data[data.len() - 20..]);
    // v0.7 reports a failed factory call as SenderAddressResult(address(0))
    if sender.is_zero() {
        return Err(UserOpError::MalformedRevert {
            function: "getSenderAddress".into(),
            data: data.clone(),
        });
    }
    Ok(sender)
}

/// Counterfactual sender plus whether it already has code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedSender {
    pub address: Address,
    pub deployed: bool,
}

/// Runs `getSenderAddress` and decodes the address it reverts with.
pub async fn resolve_sender<E: EntryPointApi + ?Sized>(
    init_code: Bytes,
    entry_point: &E,
) -> Result<Address> {
    let data = entry_point.sender_address_revert(init_code).await?;
    sender_from_revert(&data)
}

/// [`resolve_sender`] followed by a code probe at the resolved address.
pub async fn resolve_and_probe<E, C>(
    init_code: Bytes,
    entry_point: &E,
    chain: &C,
) -> Result<ResolvedSender>
where
    E: EntryPointApi + ?Sized,
    C: ChainApi + ?Sized,
{
    let address = resolve_sender(init_code, entry_point).await?;
    let code = chain.get_code(address).await?;
    let deployed = !code.as_ref().is_empty();
    tracing::info!(sender = ?address, deployed, "resolved counterfactual sender");
    Ok(ResolvedSender { address, deployed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PackedUserOperation;
    use async_trait::async_trait;
    use ethers::types::U256;

    struct RevertingEntryPoint {
        payload: Option<Bytes>,
    }

    #[async_trait]
    impl EntryPointApi for RevertingEntryPoint {
        fn address(&self) -> Address {
            Address::repeat_byte(0xee)
        }

        async fn sender_address_revert(&self, _init_code: Bytes) -> Result<Bytes> {
            self.payload.clone().ok_or(UserOpError::NoRevert {
                function: "getSenderAddress".into(),
            })
        }

        async fn get_nonce(&self, _sender: Address, _key: U256) -> Result<U256> {
            Ok(U256::zero())
        }

        async fn get_user_op_hash(&self, _op: &PackedUserOperation) -> Result<H256> {
            Ok(H256::zero())
        }
    }

    fn revert_payload(addr: Address) -> Bytes {
        // SenderAddressResult(address): 4-byte selector + one word
        let mut v = vec![0x6c, 0xa7, 0xb8, 0x06];
        v.extend_from_slice(&[0u8; 12]);
        v.extend_from_slice(addr.as_bytes());
        Bytes::from(v)
    }

    #[test]
    fn init_code_is_factory_then_calldata() {
        let factory = Address::repeat_byte(0xfa);
        let owner = Address::repeat_byte(0xaa);
        let ep = Address::repeat_byte(0xee);
        let salt = H256::from_low_u64_be(1);

        let init = build_init_code(factory, owner, salt, ep).unwrap();
        let data = factory_data(owner, salt, ep).unwrap();
        assert_eq!(&init[..20], factory.as_bytes());
        assert_eq!(&init[20..], data.as_ref());
        assert_eq!(init, InitCode::new(factory, owner, salt, ep).unwrap().to_bytes());
    }

    #[test]
    fn extracts_trailing_address() {
        let addr = Address::repeat_byte(0x42);
        assert_eq!(sender_from_revert(&revert_payload(addr)).unwrap(), addr);

        // anything may precede the address
        let mut v = vec![0x99u8; 36];
        v.extend_from_slice(addr.as_bytes());
        assert_eq!(sender_from_revert(&Bytes::from(v)).unwrap(), addr);
    }

    #[test]
    fn rejects_short_payload() {
        assert!(matches!(
            sender_from_revert(&Bytes::from(vec![1, 2, 3])),
            Err(UserOpError::MalformedRevert { .. })
        ));
        assert!(matches!(
            sender_from_revert(&Bytes::from(vec![0u8; 23])),
            Err(UserOpError::MalformedRevert { .. })
        ));
    }

    #[test]
    fn rejects_zero_sender() {
        assert!(matches!(
            sender_from_revert(&revert_payload(Address::zero())),
            Err(UserOpError::MalformedRevert { .. })
        ));
    }

    #[tokio::test]
    async fn resolution_is_deterministic() {
        let addr = Address::repeat_byte(0x42);
        let ep = RevertingEntryPoint {
            payload: Some(revert_payload(addr)),
        };
        let init = build_init_code(
            Address::repeat_byte(0xfa),
            Address::repeat_byte(0xaa),
            H256::from_low_u64_be(1),
            ep.address(),
        )
        .unwrap();

        let first = resolve_sender(init.clone(), &ep).await.unwrap();
        let second = resolve_sender(init, &ep).await.unwrap();
        assert_eq!(first, addr);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn call_that_returns_is_surfaced() {
        let ep = RevertingEntryPoint { payload: None };
        let err = resolve_sender(Bytes::default(), &ep).await.unwrap_err();
        assert!(matches!(err, UserOpError::NoRevert { .. }));
    }
}
