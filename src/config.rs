use crate::error::{Result, UserOpError};
use ethers::types::Address;
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    #[serde(default)]
    pub bundler_rpc: Option<String>,
    pub entry_point: String,
    pub account_factory: String,
    #[serde(default)]
    pub paymaster: Option<String>,
}

/// Addresses and endpoints for one network, resolved once and handed to every component.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: Option<String>,
    pub entry_point: Address,
    pub account_factory: Address,
    pub paymaster: Option<Address>,
}

pub fn parse_deployment(
    raw: DeploymentRaw,
    rpc_override: Option<String>,
    bundler_override: Option<String>,
) -> Result<Deployment> {
    let rpc_url = if let Some(rpc) = rpc_override {
        rpc
    } else if let Some(env_var) = raw.rpc_env_var.clone() {
        env::var(&env_var).unwrap_or(raw.rpc.clone())
    } else {
        raw.rpc.clone()
    };

    if rpc_url.contains("alchemy.com/v2/") || rpc_url.contains("infura.io/v3/") {
        tracing::warn!("RPC URL looks like it may contain an API key; prefer passing it through USEROP_RPC_URL");
    }

    let entry_point = parse_addr(&raw.entry_point, "entryPoint")?;
    let account_factory = parse_addr(&raw.account_factory, "accountFactory")?;
    let paymaster = raw
        .paymaster
        .as_deref()
        .map(|s| parse_addr(s, "paymaster"))
        .transpose()?
        .filter(|pm| !pm.is_zero());

    Ok(Deployment {
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url: bundler_override.or(raw.bundler_rpc),
        entry_point,
        account_factory,
        paymaster,
    })
}

pub fn load_deployment(
    path: &Path,
    rpc_override: Option<String>,
    bundler_override: Option<String>,
) -> Result<Deployment> {
    let raw = fs::read_to_string(path).map_err(|e| {
        UserOpError::Config(format!(
            "failed to read deployment json at {}: {e}",
            path.display()
        ))
    })?;
    let raw: DeploymentRaw = serde_json::from_str(&raw).map_err(|e| {
        UserOpError::Config(format!(
            "failed to parse deployment json at {}: {e}",
            path.display()
        ))
    })?;
    parse_deployment(raw, rpc_override, bundler_override)
}

fn parse_addr(s: &str, field: &str) -> Result<Address> {
    s.parse::<Address>()
        .map_err(|e| UserOpError::Config(format!("invalid {field} address {s:?}: {e}")))
}
