use crate::contracts::PaymasterApi;
use crate::encoding::{pack_paymaster_data, pack_user_op};
use crate::error::{Result, UserOpError};
use crate::types::{PaymasterAuthorization, UserOperation};
use ethers::signers::Signer;
use ethers::types::{Address, Bytes};
use std::time::{SystemTime, UNIX_EPOCH};

pub const DEFAULT_VALIDITY_WINDOW_SECS: u64 = 60 * 60;

/// Length of an ECDSA signature as produced by `signMessage` (r, s, v).
pub const SIGNATURE_LEN: usize = 65;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signs gas sponsorship for one operation on behalf of a verifying paymaster.
///
/// The paymaster contract computes the digest over the packed operation and
/// the validity window; the off-chain signer signs it as a personal message.
pub struct PaymasterAuthorizer<P, S> {
    paymaster: P,
    signer: S,
    validity_window: u64,
}

impl<P: PaymasterApi, S: Signer> PaymasterAuthorizer<P, S> {
    pub fn new(paymaster: P, signer: S) -> Self {
        Self {
            paymaster,
            signer,
            validity_window: DEFAULT_VALIDITY_WINDOW_SECS,
        }
    }

    pub fn with_validity_window(mut self, secs: u64) -> Self {
        self.validity_window = secs;
        self
    }

    pub fn address(&self) -> Address {
        self.paymaster.address()
    }

    pub async fn authorize(&self, op: &UserOperation) -> Result<PaymasterAuthorization> {
        self.authorize_at(op, now_unix()).await
    }

    /// Same as [`Self::authorize`] with an explicit `validAfter`.
    pub async fn authorize_at(
        &self,
        op: &UserOperation,
        valid_after: u64,
    ) -> Result<PaymasterAuthorization> {
        let valid_until = valid_after
            .checked_add(self.validity_window)
            .ok_or(UserOpError::Encoding {
                field: "validUntil",
                bits: 48,
            })?;
        let packed = pack_user_op(op)?;
        let hash = self
            .paymaster
            .get_hash(&packed, valid_until, valid_after)
            .await?;

        let sig = self
            .signer
            .sign_message(hash.as_bytes())
            .await
            .map_err(|e| UserOpError::Signing(format!("paymaster signer: {e}")))?;

        tracing::info!(
            paymaster = ?self.paymaster.address(),
            valid_after,
            valid_until,
            "paymaster authorization signed"
        );

        Ok(PaymasterAuthorization {
            signature: Bytes::from(sig.to_vec()),
            valid_after,
            valid_until,
        })
    }
}

impl PaymasterAuthorization {
    /// `paymasterData` for the verifying paymaster.
    pub fn paymaster_data(&self) -> Result<Bytes> {
        pack_paymaster_data(self.valid_until, self.valid_after, &self.signature)
    }
}
