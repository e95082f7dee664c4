use crate::error::{Result, UserOpError};
use crate::types::{PackedUserOperation, UserOperation};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::{Map, Value};

/// Width of each half of `accountGasLimits` / `gasFees` and of the paymaster gas fields.
pub const UINT128_BYTES: usize = 16;

/// 65-byte signature of the right shape for gas estimation, before the real one exists.
pub const DUMMY_SIGNATURE: &str = "0xfffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// Big-endian, left zero-padded to 16 bytes. Never truncates.
pub fn pad_u128(value: U256, field: &'static str) -> Result<[u8; UINT128_BYTES]> {
    if value.bits() > 128 {
        return Err(UserOpError::Encoding { field, bits: 128 });
    }
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    let mut out = [0u8; UINT128_BYTES];
    out.copy_from_slice(&word[UINT128_BYTES..]);
    Ok(out)
}

/// `pad16(hi) || pad16(lo)`.
///
/// Used for `accountGasLimits` (verificationGasLimit, callGasLimit) and for
/// `gasFees` (maxPriorityFeePerGas, maxFeePerGas).
pub fn pack_uint128_pair(
    hi: U256,
    lo: U256,
    fields: (&'static str, &'static str),
) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    out[..UINT128_BYTES].copy_from_slice(&pad_u128(hi, fields.0)?);
    out[UINT128_BYTES..].copy_from_slice(&pad_u128(lo, fields.1)?);
    Ok(out)
}

pub fn pack_account_gas_limits(verification_gas_limit: U256, call_gas_limit: U256) -> Result<[u8; 32]> {
    pack_uint128_pair(
        verification_gas_limit,
        call_gas_limit,
        ("verificationGasLimit", "callGasLimit"),
    )
}

pub fn pack_gas_fees(max_priority_fee_per_gas: U256, max_fee_per_gas: U256) -> Result<[u8; 32]> {
    pack_uint128_pair(
        max_priority_fee_per_gas,
        max_fee_per_gas,
        ("maxPriorityFeePerGas", "maxFeePerGas"),
    )
}

/// Inverse of [`pack_uint128_pair`].
pub fn unpack_uint128_pair(packed: &[u8; 32]) -> (U256, U256) {
    (
        U256::from_big_endian(&packed[..UINT128_BYTES]),
        U256::from_big_endian(&packed[UINT128_BYTES..]),
    )
}

/// `paymaster(20) || pad16(verificationGas) || pad16(postOpGas) || data`, or empty
/// when there is no usable paymaster or either gas limit is missing.
pub fn pack_paymaster_and_data(
    paymaster: Option<Address>,
    paymaster_verification_gas_limit: Option<U256>,
    paymaster_post_op_gas_limit: Option<U256>,
    paymaster_data: &Bytes,
) -> Result<Bytes> {
    let (paymaster, verification, post_op) = match (
        paymaster,
        paymaster_verification_gas_limit,
        paymaster_post_op_gas_limit,
    ) {
        (Some(pm), Some(v), Some(p)) if !pm.is_zero() => (pm, v, p),
        _ => return Ok(Bytes::default()),
    };

    let mut out = Vec::with_capacity(20 + 2 * UINT128_BYTES + paymaster_data.len());
    out.extend_from_slice(paymaster.as_bytes());
    out.extend_from_slice(&pad_u128(verification, "paymasterVerificationGasLimit")?);
    out.extend_from_slice(&pad_u128(post_op, "paymasterPostOpGasLimit")?);
    out.extend_from_slice(paymaster_data.as_ref());
    Ok(Bytes::from(out))
}

/// `abi.encode(uint48 validUntil, uint48 validAfter) || signature`.
pub fn pack_paymaster_data(valid_until: u64, valid_after: u64, signature: &Bytes) -> Result<Bytes> {
    const UINT48_MAX: u64 = (1 << 48) - 1;
    if valid_until > UINT48_MAX {
        return Err(UserOpError::Encoding { field: "validUntil", bits: 48 });
    }
    if valid_after > UINT48_MAX {
        return Err(UserOpError::Encoding { field: "validAfter", bits: 48 });
    }
    let mut out = encode(&[
        Token::Uint(U256::from(valid_until)),
        Token::Uint(U256::from(valid_after)),
    ]);
    out.extend_from_slice(signature.as_ref());
    Ok(Bytes::from(out))
}

/// Projects the expanded operation onto the v0.7 wire struct. Reads only.
pub fn pack_user_op(op: &UserOperation) -> Result<PackedUserOperation> {
    Ok(PackedUserOperation {
        sender: op.sender,
        nonce: op.nonce,
        init_code: op.init_code.clone(),
        call_data: op.call_data.clone(),
        account_gas_limits: pack_account_gas_limits(op.verification_gas_limit, op.call_gas_limit)?,
        pre_verification_gas: op.pre_verification_gas,
        gas_fees: pack_gas_fees(op.max_priority_fee_per_gas, op.max_fee_per_gas)?,
        paymaster_and_data: pack_paymaster_and_data(
            op.paymaster,
            op.paymaster_verification_gas_limit,
            op.paymaster_post_op_gas_limit,
            &op.paymaster_data,
        )?,
        signature: op.signature.clone(),
    })
}

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

pub fn fmt_h256(h: H256) -> String {
    format!("0x{}", hex::encode(h.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// Adds `factory`/`factoryData` only while the account still needs deploying.
fn insert_factory(obj: &mut Map<String, Value>, op: &UserOperation) {
    if let (Some(factory), Some(data)) = (op.factory, op.factory_data.as_ref()) {
        obj.insert("factory".into(), Value::String(fmt_address(factory)));
        obj.insert("factoryData".into(), Value::String(fmt_bytes(data)));
    }
}

/// Request object for `eth_estimateUserOperationGas`: no gas fields, dummy signature.
pub fn user_op_to_estimation_json(op: &UserOperation) -> Value {
    let mut obj = Map::new();
    obj.insert("sender".into(), Value::String(fmt_address(op.sender)));
    obj.insert("nonce".into(), Value::String(fmt_u256(op.nonce)));
    obj.insert("callData".into(), Value::String(fmt_bytes(&op.call_data)));
    obj.insert("signature".into(), Value::String(DUMMY_SIGNATURE.to_string()));
    insert_factory(&mut obj, op);
    Value::Object(obj)
}

/// Request object for `eth_sendUserOperation`.
pub fn user_op_to_json(op: &UserOperation) -> Value {
    let mut obj = Map::new();
    obj.insert("sender".into(), Value::String(fmt_address(op.sender)));
    obj.insert("nonce".into(), Value::String(fmt_u256(op.nonce)));
    obj.insert("initCode".into(), Value::String(fmt_bytes(&op.init_code)));
    obj.insert("callData".into(), Value::String(fmt_bytes(&op.call_data)));
    obj.insert("callGasLimit".into(), Value::String(fmt_u256(op.call_gas_limit)));
    obj.insert(
        "verificationGasLimit".into(),
        Value::String(fmt_u256(op.verification_gas_limit)),
    );
    obj.insert(
        "preVerificationGas".into(),
        Value::String(fmt_u256(op.pre_verification_gas)),
    );
    obj.insert("maxFeePerGas".into(), Value::String(fmt_u256(op.max_fee_per_gas)));
    obj.insert(
        "maxPriorityFeePerGas".into(),
        Value::String(fmt_u256(op.max_priority_fee_per_gas)),
    );
    if let Some(pm) = op.paymaster.filter(|pm| !pm.is_zero()) {
        obj.insert("paymaster".into(), Value::String(fmt_address(pm)));
        if let Some(v) = op.paymaster_verification_gas_limit {
            obj.insert("paymasterVerificationGasLimit".into(), Value::String(fmt_u256(v)));
        }
        if let Some(v) = op.paymaster_post_op_gas_limit {
            obj.insert("paymasterPostOpGasLimit".into(), Value::String(fmt_u256(v)));
        }
        obj.insert("paymasterData".into(), Value::String(fmt_bytes(&op.paymaster_data)));
    }
    obj.insert("signature".into(), Value::String(fmt_bytes(&op.signature)));
    insert_factory(&mut obj, op);
    Value::Object(obj)
}

/// Hex quantity from an RPC reply. An empty body is not zero.
pub fn parse_u256_quantity(s: &str) -> Result<U256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Err(UserOpError::estimation("empty quantity"));
    }
    U256::from_str_radix(s, 16).map_err(|e| UserOpError::estimation(format!("invalid quantity {s:?}: {e}")))
}

/// A `bytes32` salt given as `0x`-prefixed hex (left-padded) or a decimal number.
pub fn parse_salt(s: &str) -> Result<H256> {
    let value = match s.strip_prefix("0x") {
        Some(hex) if hex.len() <= 64 && !hex.is_empty() => U256::from_str_radix(hex, 16)
            .map_err(|e| UserOpError::Config(format!("invalid salt {s:?}: {e}")))?,
        Some(_) => return Err(UserOpError::Config(format!("invalid salt {s:?}"))),
        None => U256::from_dec_str(s)
            .map_err(|e| UserOpError::Config(format!("invalid salt {s:?}: {e:?}")))?,
    };
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    Ok(H256(out))
}

pub fn parse_h256(s: &str) -> Result<H256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| UserOpError::Provider(format!("invalid hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(UserOpError::Provider(format!(
            "expected 32-byte hex, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(&bytes))
}

pub fn parse_bytes(s: &str) -> std::result::Result<Bytes, hex::FromHexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    Ok(Bytes::from(hex::decode(s)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op() -> UserOperation {
        UserOperation {
            sender: Address::repeat_byte(0x5e),
            nonce: U256::from(7),
            call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
            call_gas_limit: U256::from(100_000),
            verification_gas_limit: U256::from(1_200_000),
            pre_verification_gas: U256::from(400_000),
            max_fee_per_gas: U256::from(10_000_000_000u64),
            max_priority_fee_per_gas: U256::from(5_000_000_000u64),
            ..Default::default()
        }
    }

    #[test]
    fn account_gas_limits_layout() {
        let a = U256::from(0x0102u64);
        let b = U256::from(u128::MAX);
        let packed = pack_account_gas_limits(a, b).unwrap();
        assert_eq!(packed.len(), 32);
        assert_eq!(&packed[..14], &[0u8; 14]);
        assert_eq!(&packed[14..16], &[0x01, 0x02]);
        assert_eq!(&packed[16..], &[0xff; 16]);
        assert_eq!(unpack_uint128_pair(&packed), (a, b));
    }

    #[test]
    fn account_gas_limits_rejects_overflow() {
        let too_big = U256::from(u128::MAX) + U256::one();
        let err = pack_account_gas_limits(U256::one(), too_big).unwrap_err();
        assert!(matches!(err, UserOpError::Encoding { field: "callGasLimit", bits: 128 }));
    }

    #[test]
    fn gas_fees_puts_priority_fee_first() {
        let packed = pack_gas_fees(U256::from(5), U256::from(10)).unwrap();
        assert_eq!(packed[15], 5);
        assert_eq!(packed[31], 10);
    }

    #[test]
    fn paymaster_and_data_empty_cases() {
        let pm = Address::repeat_byte(0xbb);
        let data = Bytes::from(vec![1, 2, 3]);
        let gas = Some(U256::from(1));

        assert!(pack_paymaster_and_data(None, gas, gas, &data).unwrap().is_empty());
        assert!(pack_paymaster_and_data(Some(Address::zero()), gas, gas, &data)
            .unwrap()
            .is_empty());
        assert!(pack_paymaster_and_data(Some(pm), None, gas, &data).unwrap().is_empty());
        assert!(pack_paymaster_and_data(Some(pm), gas, None, &data).unwrap().is_empty());
    }

    #[test]
    fn paymaster_and_data_layout() {
        let pm = Address::repeat_byte(0xbb);
        let data = Bytes::from(vec![0xde, 0xad]);
        let out = pack_paymaster_and_data(
            Some(pm),
            Some(U256::from(200_000)),
            Some(U256::from(21_000)),
            &data,
        )
        .unwrap();
        assert_eq!(out.len(), 20 + 16 + 16 + 2);
        assert_eq!(&out[..20], pm.as_bytes());
        assert_eq!(U256::from_big_endian(&out[20..36]), U256::from(200_000));
        assert_eq!(U256::from_big_endian(&out[36..52]), U256::from(21_000));
        assert_eq!(&out[52..], &[0xde, 0xad]);

        let no_data = pack_paymaster_and_data(
            Some(pm),
            Some(U256::from(1)),
            Some(U256::from(1)),
            &Bytes::default(),
        )
        .unwrap();
        assert_eq!(no_data.len(), 52);
    }

    #[test]
    fn paymaster_data_prefix_is_two_words() {
        let sig = Bytes::from(vec![0x1c; 65]);
        let out = pack_paymaster_data(3_600 + 1_700_000_000, 1_700_000_000, &sig).unwrap();
        assert_eq!(out.len(), 64 + 65);
        assert_eq!(U256::from_big_endian(&out[..32]), U256::from(1_700_003_600u64));
        assert_eq!(U256::from_big_endian(&out[32..64]), U256::from(1_700_000_000u64));
        assert_eq!(&out[64..], sig.as_ref());
    }

    #[test]
    fn pack_is_pure() {
        let op = op();
        let first = pack_user_op(&op).unwrap();
        let second = pack_user_op(&op).unwrap();
        assert_eq!(first, second);
        assert!(first.paymaster_and_data.is_empty());
        assert_eq!(
            unpack_uint128_pair(&first.account_gas_limits),
            (op.verification_gas_limit, op.call_gas_limit)
        );
        assert_eq!(
            unpack_uint128_pair(&first.gas_fees),
            (op.max_priority_fee_per_gas, op.max_fee_per_gas)
        );
    }

    #[test]
    fn salt_accepts_full_bytes32() {
        assert_eq!(parse_salt("1").unwrap(), H256::from_low_u64_be(1));
        assert_eq!(parse_salt("0x01").unwrap(), H256::from_low_u64_be(1));

        let wide = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_salt(&wide).unwrap(), H256::repeat_byte(0xab));

        assert!(parse_salt(&format!("0x{}", "ab".repeat(33))).is_err());
        assert!(parse_salt("0x").is_err());
        assert!(parse_salt("salt").is_err());
    }

    #[test]
    fn quantity_formatting() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(0x1a2bu64)), "0x1a2b");
        assert_eq!(parse_u256_quantity("0x1a2b").unwrap(), U256::from(0x1a2bu64));
        assert_eq!(parse_u256_quantity("0x0").unwrap(), U256::zero());
        assert!(matches!(parse_u256_quantity("0x"), Err(UserOpError::Estimation(_))));
        assert!(matches!(parse_u256_quantity(""), Err(UserOpError::Estimation(_))));
        assert!(parse_u256_quantity("0xzz").is_err());
    }

    #[test]
    fn send_json_includes_factory_only_when_present() {
        let mut op = op();
        let v = user_op_to_json(&op);
        assert!(v.get("factory").is_none());
        assert!(v.get("paymaster").is_none());
        assert_eq!(v["initCode"], "0x");
        assert_eq!(v["callGasLimit"], "0x186a0");

        op.factory = Some(Address::repeat_byte(0xfa));
        op.factory_data = Some(Bytes::from(vec![0xab]));
        let v = user_op_to_json(&op);
        assert_eq!(v["factory"], fmt_address(Address::repeat_byte(0xfa)));
        assert_eq!(v["factoryData"], "0xab");
    }

    #[test]
    fn estimation_json_uses_dummy_signature() {
        let v = user_op_to_estimation_json(&op());
        assert_eq!(v["signature"], DUMMY_SIGNATURE);
        assert!(v.get("callGasLimit").is_none());
        assert_eq!(parse_bytes(DUMMY_SIGNATURE).unwrap().len(), 65);
    }
}
