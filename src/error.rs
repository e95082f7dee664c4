use ethers::types::Bytes;
use thiserror::Error;

pub type Result<T, E = UserOpError> = std::result::Result<T, E>;

/// Failures of the user operation pipeline.
///
/// Nothing here is retried. Every variant aborts the submission that raised it
/// and carries the underlying payload so the caller can diagnose it.
#[derive(Debug, Error)]
pub enum UserOpError {
    /// `getSenderAddress` reverted but the payload does not hold an address.
    #[error("malformed revert data from {function}: {data}")]
    MalformedRevert { function: String, data: Bytes },

    /// A call that must revert returned normally.
    #[error("{function} did not revert")]
    NoRevert { function: String },

    /// Node or contract call failure (including reverts we did not expect).
    #[error("provider error: {0}")]
    Provider(String),

    /// The bundler answered with a JSON-RPC error object.
    #[error("RPC error from {method}: {payload}")]
    Rpc {
        method: String,
        payload: serde_json::Value,
    },

    #[error("transport error: {0}")]
    Transport(String),

    /// Gas or fee data missing or unparsable.
    #[error("estimation failed: {0}")]
    Estimation(String),

    /// An integer does not fit its packed field.
    #[error("{field} does not fit in {bits} bits")]
    Encoding { field: &'static str, bits: usize },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("config error: {0}")]
    Config(String),
}

impl UserOpError {
    pub fn provider(err: impl std::fmt::Display) -> Self {
        Self::Provider(err.to_string())
    }

    pub fn estimation(msg: impl Into<String>) -> Self {
        Self::Estimation(msg.into())
    }
}

impl From<ethers::abi::ParseError> for UserOpError {
    fn from(err: ethers::abi::ParseError) -> Self {
        Self::Abi(err.to_string())
    }
}

impl From<ethers::contract::AbiError> for UserOpError {
    fn from(err: ethers::contract::AbiError) -> Self {
        Self::Abi(err.to_string())
    }
}
