//! Assembles, signs and submits a user operation.
//!
//! One call to [`OperationBuilder::build`] runs the whole sequence: resolve the
//! sender, fill placeholders, estimate gas and fees, get paymaster approval,
//! hash and sign. Every step waits on the previous one and any failure aborts
//! the build, so a partially filled operation is never signed or sent.

use crate::bundler::{BundlerClient, RpcTransport};
use crate::contracts::{ChainApi, EntryPointApi, PaymasterApi};
use crate::encoding::{pack_user_op, user_op_to_json};
use crate::error::{Result, UserOpError};
use crate::gas::{apply_estimates, estimate_fees, estimate_operation_gas};
use crate::paymaster::PaymasterAuthorizer;
use crate::sender::{resolve_and_probe, InitCode};
use crate::types::{SimpleUserOperation, UserOperation};
use ethers::signers::Signer;
use ethers::types::{Address, Bytes, H256, U256};

/// Values the operation carries before the bundler has estimated anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlaceholderGas {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_verification_gas_limit: U256,
}

const GWEI: u64 = 1_000_000_000;

impl Default for PlaceholderGas {
    fn default() -> Self {
        Self {
            call_gas_limit: U256::from(400_000u64),
            verification_gas_limit: U256::from(400_000u64),
            pre_verification_gas: U256::from(200_000u64),
            max_fee_per_gas: U256::from(10 * GWEI),
            max_priority_fee_per_gas: U256::from(5 * GWEI),
            paymaster_verification_gas_limit: U256::from(200_000u64),
        }
    }
}

impl PlaceholderGas {
    /// Limits generous enough to deploy an account and run `handleOps`
    /// directly against a dev node, where nothing is estimated.
    pub fn direct() -> Self {
        Self {
            call_gas_limit: U256::from(100_000u64),
            verification_gas_limit: U256::from(1_200_000u64),
            pre_verification_gas: U256::from(400_000u64),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct BuilderConfig {
    pub factory: Address,
    pub salt: H256,
    pub nonce_key: U256,
    pub placeholder: PlaceholderGas,
    /// Safety margin added to every bundler gas estimate.
    pub gas_margin_percent: u64,
    /// Replaces the bundler's paymaster verification estimate when set.
    pub paymaster_verification_gas_override: Option<U256>,
    pub paymaster_post_op_gas_limit: U256,
}

impl BuilderConfig {
    pub fn new(factory: Address) -> Self {
        Self {
            factory,
            salt: H256::from_low_u64_be(1),
            nonce_key: U256::zero(),
            placeholder: PlaceholderGas::default(),
            gas_margin_percent: 10,
            paymaster_verification_gas_override: Some(U256::from(1_000_000u64)),
            paymaster_post_op_gas_limit: U256::from(21_000u64),
        }
    }
}

/// Whether gas and fee fields come from the bundler or stay at their placeholders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GasMode {
    Estimate,
    Placeholder,
}

/// A fully populated, owner-signed operation.
#[derive(Clone, Debug)]
pub struct SignedOperation {
    pub op: UserOperation,
    /// `EntryPoint.getUserOpHash` of the operation that was signed.
    pub user_op_hash: H256,
}

pub struct OperationBuilder<E, C, T, P, S> {
    entry_point: E,
    chain: C,
    bundler: Option<BundlerClient<T>>,
    paymaster: Option<PaymasterAuthorizer<P, S>>,
    owner: S,
    config: BuilderConfig,
}

impl<E, C, T, P, S> OperationBuilder<E, C, T, P, S>
where
    E: EntryPointApi,
    C: ChainApi,
    T: RpcTransport,
    P: PaymasterApi,
    S: Signer,
{
    pub fn new(entry_point: E, chain: C, owner: S, config: BuilderConfig) -> Self {
        Self {
            entry_point,
            chain,
            bundler: None,
            paymaster: None,
            owner,
            config,
        }
    }

    pub fn with_bundler(mut self, bundler: BundlerClient<T>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    pub fn with_paymaster(mut self, paymaster: PaymasterAuthorizer<P, S>) -> Self {
        self.paymaster = Some(paymaster);
        self
    }

    pub fn entry_point(&self) -> &E {
        &self.entry_point
    }

    fn bundler(&self) -> Result<&BundlerClient<T>> {
        self.bundler
            .as_ref()
            .ok_or_else(|| UserOpError::Config("no bundler configured".into()))
    }

    pub fn init_code(&self) -> Result<InitCode> {
        InitCode::new(
            self.config.factory,
            self.owner.address(),
            self.config.salt,
            self.entry_point.address(),
        )
    }

    /// Sender, nonce and init fields with placeholder gas. Nothing estimated or signed.
    pub async fn draft(&self, simple: &SimpleUserOperation) -> Result<UserOperation> {
        let init = self.init_code()?;
        let resolved = resolve_and_probe(init.to_bytes(), &self.entry_point, &self.chain).await?;
        let nonce = self
            .entry_point
            .get_nonce(resolved.address, self.config.nonce_key)
            .await?;

        let placeholder = &self.config.placeholder;
        let sponsored = simple.wants_sponsorship();
        let mut op = UserOperation {
            sender: resolved.address,
            nonce,
            factory: Some(init.factory),
            init_code: init.to_bytes(),
            factory_data: Some(init.factory_data),
            call_data: simple.call_data.clone(),
            call_gas_limit: placeholder.call_gas_limit,
            verification_gas_limit: placeholder.verification_gas_limit,
            pre_verification_gas: placeholder.pre_verification_gas,
            max_fee_per_gas: placeholder.max_fee_per_gas,
            max_priority_fee_per_gas: placeholder.max_priority_fee_per_gas,
            paymaster: simple.paymaster.filter(|_| sponsored),
            paymaster_verification_gas_limit: sponsored
                .then_some(placeholder.paymaster_verification_gas_limit),
            paymaster_post_op_gas_limit: sponsored
                .then_some(self.config.paymaster_post_op_gas_limit),
            paymaster_data: if sponsored {
                simple.paymaster_data.clone()
            } else {
                Bytes::default()
            },
            signature: Bytes::default(),
        };
        if resolved.deployed {
            op.clear_init();
        }

        tracing::info!(sender = ?op.sender, nonce = %op.nonce, deployed = resolved.deployed, "drafted user operation");
        Ok(op)
    }

    /// Runs the full pipeline and returns the signed operation.
    pub async fn build(&self, simple: &SimpleUserOperation, mode: GasMode) -> Result<SignedOperation> {
        let mut op = self.draft(simple).await?;

        if mode == GasMode::Estimate {
            let bundler = self.bundler()?;
            let gas = estimate_operation_gas(
                bundler,
                &op,
                self.entry_point.address(),
                self.config.gas_margin_percent,
            )
            .await?;
            let fees = estimate_fees(bundler, &self.chain).await?;
            apply_estimates(
                &mut op,
                &gas,
                &fees,
                self.config.paymaster_verification_gas_override,
            );
            tracing::info!(
                call_gas_limit = %op.call_gas_limit,
                verification_gas_limit = %op.verification_gas_limit,
                pre_verification_gas = %op.pre_verification_gas,
                max_fee_per_gas = %op.max_fee_per_gas,
                max_priority_fee_per_gas = %op.max_priority_fee_per_gas,
                "applied gas estimates"
            );
        }

        if simple.wants_sponsorship() {
            let authorizer = self.paymaster.as_ref().ok_or_else(|| {
                UserOpError::Config("sponsorship requested but no paymaster signer configured".into())
            })?;
            if simple.paymaster != Some(authorizer.address()) {
                return Err(UserOpError::Config(format!(
                    "requested paymaster {:?} does not match configured paymaster {:?}",
                    simple.paymaster,
                    authorizer.address()
                )));
            }
            let auth = authorizer.authorize(&op).await?;
            op.paymaster_data = auth.paymaster_data()?;
        }

        self.sign(op).await
    }

    /// Hashes the packed operation through the entry point and signs it as the owner.
    pub async fn sign(&self, mut op: UserOperation) -> Result<SignedOperation> {
        let packed = pack_user_op(&op)?;
        let user_op_hash = self.entry_point.get_user_op_hash(&packed).await?;
        let sig = self
            .owner
            .sign_message(user_op_hash.as_bytes())
            .await
            .map_err(|e| UserOpError::Signing(format!("owner signer: {e}")))?;
        op.signature = Bytes::from(sig.to_vec());

        tracing::info!(user_op_hash = ?user_op_hash, "signed user operation");
        Ok(SignedOperation { op, user_op_hash })
    }

    /// Sends a signed operation through `eth_sendUserOperation`.
    pub async fn submit(&self, signed: &SignedOperation) -> Result<H256> {
        // re-packing surfaces any field that no longer fits its wire width
        pack_user_op(&signed.op)?;
        let id = self
            .bundler()?
            .send_user_operation(user_op_to_json(&signed.op), self.entry_point.address())
            .await?;
        tracing::info!(user_op_hash = ?id, "user operation accepted by bundler");
        Ok(id)
    }

    /// [`Self::build`] with estimation, then [`Self::submit`].
    pub async fn send(&self, simple: &SimpleUserOperation) -> Result<H256> {
        let signed = self.build(simple, GasMode::Estimate).await?;
        self.submit(&signed).await
    }
}
