//! On-chain collaborators: EntryPoint v0.7, the account factory and the
//! verifying paymaster, plus the node reads the pipeline needs.
//!
//! The pipeline only talks to these through the `*Api` traits so it can run
//! against any middleware stack (or an in-memory stub in tests).

use crate::error::{Result, UserOpError};
use crate::types::PackedUserOperation;
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, Token, Tokenizable};
use ethers::contract::{BaseContract, Contract};
use ethers::providers::Middleware;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};
use std::sync::Arc;

const PACKED_USER_OP_COMPONENTS: &str = r#"[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"bytes32","name":"accountGasLimits","type":"bytes32"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"bytes32","name":"gasFees","type":"bytes32"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}]"#;

fn entry_point_abi() -> Result<Abi> {
    let json = format!(
        r#"[
            {{"inputs":[{{"internalType":"bytes","name":"initCode","type":"bytes"}}],"name":"getSenderAddress","outputs":[],"stateMutability":"nonpayable","type":"function"}},
            {{"inputs":[{{"internalType":"address","name":"sender","type":"address"}},{{"internalType":"uint192","name":"key","type":"uint192"}}],"name":"getNonce","outputs":[{{"internalType":"uint256","name":"nonce","type":"uint256"}}],"stateMutability":"view","type":"function"}},
            {{"inputs":[{{"components":{c},"internalType":"struct PackedUserOperation","name":"userOp","type":"tuple"}}],"name":"getUserOpHash","outputs":[{{"internalType":"bytes32","name":"","type":"bytes32"}}],"stateMutability":"view","type":"function"}},
            {{"inputs":[{{"components":{c},"internalType":"struct PackedUserOperation[]","name":"ops","type":"tuple[]"}},{{"internalType":"address payable","name":"beneficiary","type":"address"}}],"name":"handleOps","outputs":[],"stateMutability":"nonpayable","type":"function"}},
            {{"inputs":[{{"internalType":"address","name":"account","type":"address"}}],"name":"depositTo","outputs":[],"stateMutability":"payable","type":"function"}}
        ]"#,
        c = PACKED_USER_OP_COMPONENTS
    );
    serde_json::from_str(&json).map_err(|e| UserOpError::Abi(format!("EntryPoint ABI: {e}")))
}

fn paymaster_abi() -> Result<Abi> {
    let json = format!(
        r#"[
            {{"inputs":[{{"components":{c},"internalType":"struct PackedUserOperation","name":"userOp","type":"tuple"}},{{"internalType":"uint48","name":"validUntil","type":"uint48"}},{{"internalType":"uint48","name":"validAfter","type":"uint48"}}],"name":"getHash","outputs":[{{"internalType":"bytes32","name":"","type":"bytes32"}}],"stateMutability":"view","type":"function"}},
            {{"inputs":[{{"internalType":"address","name":"target","type":"address"}},{{"internalType":"uint256","name":"amount","type":"uint256"}}],"name":"mintTokens","outputs":[],"stateMutability":"nonpayable","type":"function"}}
        ]"#,
        c = PACKED_USER_OP_COMPONENTS
    );
    serde_json::from_str(&json).map_err(|e| UserOpError::Abi(format!("Paymaster ABI: {e}")))
}

fn packed_token(op: &PackedUserOperation) -> Token {
    op.as_abi_tuple().into_token()
}

/// ABI encoding of `createAccount(owner, salt, entryPoint)`.
pub fn factory_data(owner: Address, salt: H256, entry_point: Address) -> Result<Bytes> {
    let abi = AbiParser::default().parse(&[
        "function createAccount(address owner, bytes32 salt, address entryPoint) returns (address)",
    ])?;
    let factory = BaseContract::from(abi);
    Ok(factory.encode("createAccount", (owner, salt, entry_point))?)
}

#[async_trait]
pub trait EntryPointApi: Send + Sync {
    fn address(&self) -> Address;

    /// Calls `getSenderAddress(initCode)` and returns the revert payload.
    ///
    /// The call always reverts on a healthy entry point. A normal return is
    /// `NoRevert`; a failure without revert data is `Provider`.
    async fn sender_address_revert(&self, init_code: Bytes) -> Result<Bytes>;

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256>;

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256>;
}

#[async_trait]
pub trait PaymasterApi: Send + Sync {
    fn address(&self) -> Address;

    async fn get_hash(
        &self,
        op: &PackedUserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256>;
}

/// Plain node reads.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn get_code(&self, address: Address) -> Result<Bytes>;

    /// `maxFeePerGas` from the node's EIP-1559 fee data.
    async fn max_fee_per_gas(&self) -> Result<U256>;
}

pub struct EntryPoint<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> EntryPoint<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        Ok(Self {
            contract: Contract::new(address, entry_point_abi()?, client),
        })
    }

    /// Executes the operations directly, bypassing the bundler.
    pub async fn handle_ops(
        &self,
        ops: &[PackedUserOperation],
        beneficiary: Address,
    ) -> Result<Option<TransactionReceipt>> {
        let ops = Token::Array(ops.iter().map(packed_token).collect());
        let call = self
            .contract
            .method::<_, ()>("handleOps", (ops, beneficiary))?;
        let pending = call.send().await.map_err(UserOpError::provider)?;
        tracing::info!(tx = ?pending.tx_hash(), "handleOps sent");
        pending.await.map_err(UserOpError::provider)
    }

    pub async fn deposit_to(
        &self,
        account: Address,
        value: U256,
    ) -> Result<Option<TransactionReceipt>> {
        let call = self
            .contract
            .method::<_, ()>("depositTo", account)?
            .value(value);
        let pending = call.send().await.map_err(UserOpError::provider)?;
        tracing::info!(tx = ?pending.tx_hash(), "depositTo sent");
        pending.await.map_err(UserOpError::provider)
    }
}

#[async_trait]
impl<M: Middleware + 'static> EntryPointApi for EntryPoint<M> {
    fn address(&self) -> Address {
        self.contract.address()
    }

    async fn sender_address_revert(&self, init_code: Bytes) -> Result<Bytes> {
        let res = self
            .contract
            .method::<_, ()>("getSenderAddress", init_code)?
            .call()
            .await;

        match res {
            Ok(()) => Err(UserOpError::NoRevert {
                function: "getSenderAddress".into(),
            }),
            Err(err) => match err.as_revert() {
                Some(data) => Ok(data.clone()),
                None => Err(UserOpError::provider(err)),
            },
        }
    }

    async fn get_nonce(&self, sender: Address, key: U256) -> Result<U256> {
        self.contract
            .method::<_, U256>("getNonce", (sender, key))?
            .call()
            .await
            .map_err(UserOpError::provider)
    }

    async fn get_user_op_hash(&self, op: &PackedUserOperation) -> Result<H256> {
        self.contract
            .method::<_, H256>("getUserOpHash", (packed_token(op),))?
            .call()
            .await
            .map_err(UserOpError::provider)
    }
}

pub struct Paymaster<M> {
    contract: Contract<M>,
}

impl<M: Middleware + 'static> Paymaster<M> {
    pub fn new(address: Address, client: Arc<M>) -> Result<Self> {
        Ok(Self {
            contract: Contract::new(address, paymaster_abi()?, client),
        })
    }

    pub async fn mint_tokens(
        &self,
        target: Address,
        amount: U256,
    ) -> Result<Option<TransactionReceipt>> {
        let call = self
            .contract
            .method::<_, ()>("mintTokens", (target, amount))?;
        let pending = call.send().await.map_err(UserOpError::provider)?;
        tracing::info!(tx = ?pending.tx_hash(), "mintTokens sent");
        pending.await.map_err(UserOpError::provider)
    }
}

#[async_trait]
impl<M: Middleware + 'static> PaymasterApi for Paymaster<M> {
    fn address(&self) -> Address {
        self.contract.address()
    }

    async fn get_hash(
        &self,
        op: &PackedUserOperation,
        valid_until: u64,
        valid_after: u64,
    ) -> Result<H256> {
        self.contract
            .method::<_, H256>(
                "getHash",
                (
                    packed_token(op),
                    U256::from(valid_until),
                    U256::from(valid_after),
                ),
            )?
            .call()
            .await
            .map_err(UserOpError::provider)
    }
}

pub struct Node<M> {
    client: Arc<M>,
}

impl<M> Node<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainApi for Node<M> {
    async fn get_code(&self, address: Address) -> Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .map_err(UserOpError::provider)
    }

    async fn max_fee_per_gas(&self) -> Result<U256> {
        let (max_fee_per_gas, _priority) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .map_err(UserOpError::provider)?;
        Ok(max_fee_per_gas)
    }
}
