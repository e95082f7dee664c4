use crate::encoding::{fmt_address, parse_h256, parse_u256_quantity};
use crate::error::{Result, UserOpError};
use crate::types::GasEstimates;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;

/// One JSON-RPC round trip: returns `result` or the error object as `Rpc`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        tracing::debug!(method, body = %req, "bundler request");

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| UserOpError::Transport(format!("POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| UserOpError::Transport(format!("failed to decode JSON: {e}")))?;

        if let Some(err) = body.get("error") {
            return Err(UserOpError::Rpc {
                method: method.to_string(),
                payload: err.clone(),
            });
        }

        if !status.is_success() {
            return Err(UserOpError::Transport(format!("HTTP {status}: {body}")));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| UserOpError::Transport(format!("{method}: missing result field")))
    }
}

/// ERC-4337 bundler endpoints used by the pipeline.
#[derive(Debug, Clone)]
pub struct BundlerClient<T> {
    transport: T,
}

impl BundlerClient<HttpTransport> {
    pub fn http(url: String) -> Self {
        Self::new(HttpTransport::new(url))
    }
}

impl<T: RpcTransport> BundlerClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .transport
            .request("eth_estimateUserOperationGas", params)
            .await?;
        parse_gas_estimates(&res)
    }

    pub async fn send_user_operation(&self, user_op: Value, entrypoint: Address) -> Result<H256> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self.transport.request("eth_sendUserOperation", params).await?;
        parse_userop_hash(&res)
    }

    /// `rundler_maxPriorityFeePerGas`, a hex quantity string.
    pub async fn max_priority_fee_per_gas(&self) -> Result<U256> {
        let res = self
            .transport
            .request("rundler_maxPriorityFeePerGas", serde_json::json!([]))
            .await?;
        let s = res.as_str().ok_or_else(|| {
            UserOpError::estimation(format!(
                "rundler_maxPriorityFeePerGas: expected hex string, got {res}"
            ))
        })?;
        parse_u256_quantity(s)
    }
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| UserOpError::estimation(format!("missing or invalid field {key}")))?;
    parse_u256_quantity(s)
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates> {
    let paymaster_verification_gas_limit = match res.get("paymasterVerificationGasLimit") {
        None | Some(Value::Null) => None,
        Some(_) => Some(parse_u256_field(res, "paymasterVerificationGasLimit")?),
    };
    Ok(GasEstimates {
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        paymaster_verification_gas_limit,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256> {
    // Most bundlers return the userOpHash directly as a JSON string; some wrap it.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(UserOpError::Provider(format!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {res}"
        )));
    };

    parse_h256(hash_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    const HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    struct Canned {
        reply: Result<Value>,
        seen: Mutex<Vec<(String, Value)>>,
    }

    impl Canned {
        fn ok(v: Value) -> Self {
            Self {
                reply: Ok(v),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RpcTransport for Canned {
        async fn request(&self, method: &str, params: Value) -> Result<Value> {
            self.seen.lock().unwrap().push((method.to_string(), params));
            match &self.reply {
                Ok(v) => Ok(v.clone()),
                Err(UserOpError::Rpc { method, payload }) => Err(UserOpError::Rpc {
                    method: method.clone(),
                    payload: payload.clone(),
                }),
                Err(e) => Err(UserOpError::Transport(e.to_string())),
            }
        }
    }

    #[test]
    fn parse_userop_hash_shapes() {
        let want = parse_h256(HASH).unwrap();
        for res in [
            json!(HASH),
            json!({ "result": HASH }),
            json!({ "userOpHash": HASH }),
            json!({ "userOperationHash": HASH }),
        ] {
            assert_eq!(parse_userop_hash(&res).unwrap(), want);
        }
        assert!(parse_userop_hash(&json!({ "foo": "bar" })).is_err());
    }

    #[test]
    fn gas_estimates_require_all_limits() {
        let full = json!({
            "preVerificationGas": "0xc350",
            "callGasLimit": "0x186a0",
            "verificationGasLimit": "0x30d40",
        });
        let est = parse_gas_estimates(&full).unwrap();
        assert_eq!(est.pre_verification_gas, U256::from(50_000));
        assert_eq!(est.call_gas_limit, U256::from(100_000));
        assert_eq!(est.verification_gas_limit, U256::from(200_000));
        assert_eq!(est.paymaster_verification_gas_limit, None);

        let missing = json!({ "preVerificationGas": "0xc350", "callGasLimit": "0x186a0" });
        assert!(matches!(
            parse_gas_estimates(&missing),
            Err(UserOpError::Estimation(_))
        ));
    }

    #[tokio::test]
    async fn priority_fee_is_parsed_as_hex() {
        let bundler = BundlerClient::new(Canned::ok(json!("0x3b9aca00")));
        let fee = bundler.max_priority_fee_per_gas().await.unwrap();
        assert_eq!(fee, U256::from(1_000_000_000u64));

        let seen = bundler.transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "rundler_maxPriorityFeePerGas");
        assert_eq!(seen[0].1, json!([]));
    }

    #[test]
    fn gas_estimates_reject_empty_quantities() {
        let empty = json!({
            "preVerificationGas": "0x",
            "callGasLimit": "0x",
            "verificationGasLimit": "",
        });
        assert!(matches!(
            parse_gas_estimates(&empty),
            Err(UserOpError::Estimation(_))
        ));

        let empty_paymaster = json!({
            "preVerificationGas": "0xc350",
            "callGasLimit": "0x186a0",
            "verificationGasLimit": "0x30d40",
            "paymasterVerificationGasLimit": "0x",
        });
        assert!(matches!(
            parse_gas_estimates(&empty_paymaster),
            Err(UserOpError::Estimation(_))
        ));
    }

    #[tokio::test]
    async fn priority_fee_rejects_empty_quantity() {
        let bundler = BundlerClient::new(Canned::ok(json!("0x")));
        assert!(matches!(
            bundler.max_priority_fee_per_gas().await,
            Err(UserOpError::Estimation(_))
        ));
    }

    #[tokio::test]
    async fn priority_fee_rejects_non_string() {
        let bundler = BundlerClient::new(Canned::ok(json!(12)));
        assert!(matches!(
            bundler.max_priority_fee_per_gas().await,
            Err(UserOpError::Estimation(_))
        ));
    }

    #[tokio::test]
    async fn send_passes_op_and_entry_point() {
        let bundler = BundlerClient::new(Canned::ok(json!(HASH)));
        let ep = Address::repeat_byte(0xee);
        let hash = bundler
            .send_user_operation(json!({ "sender": "0x01" }), ep)
            .await
            .unwrap();
        assert_eq!(hash, parse_h256(HASH).unwrap());

        let seen = bundler.transport.seen.lock().unwrap();
        assert_eq!(seen[0].0, "eth_sendUserOperation");
        assert_eq!(seen[0].1, json!([{ "sender": "0x01" }, fmt_address(ep)]));
    }

    #[tokio::test]
    async fn rpc_error_payload_is_preserved() {
        let payload = json!({ "code": -32500, "message": "AA21 didn't pay prefund" });
        let bundler = BundlerClient::new(Canned {
            reply: Err(UserOpError::Rpc {
                method: "eth_estimateUserOperationGas".into(),
                payload: payload.clone(),
            }),
            seen: Mutex::new(Vec::new()),
        });
        let err = bundler
            .estimate_user_operation_gas(json!({}), Address::zero())
            .await
            .unwrap_err();
        match err {
            UserOpError::Rpc { payload: got, .. } => assert_eq!(got, payload),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
