//! 计划签名与校验
//!
//! 规范字节 → SHA-256 → 对 32 字节摘要做 Ed25519 签名；签名以 128 位十六进制传输。

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::canonical::{from_canonical_bytes, to_canonical_bytes};
use super::plan::TaskPlan;
use crate::core::error::{GateError, SignatureError};
use crate::identity::{address_of, Identity};

fn digest(canonical: &[u8]) -> [u8; 32] {
    Sha256::digest(canonical).into()
}

/// 对规范字节签名，返回十六进制签名
pub fn sign_bytes(identity: &Identity, canonical: &[u8]) -> String {
    hex::encode(identity.sign_bytes(&digest(canonical)).to_bytes())
}

pub fn sign(identity: &Identity, plan: &TaskPlan) -> Result<String, GateError> {
    let canonical =
        to_canonical_bytes(plan).map_err(|e| GateError::InvalidPlan(e.to_string()))?;
    Ok(sign_bytes(identity, &canonical))
}

fn parse_signature(signature_hex: &str) -> Result<Signature, SignatureError> {
    if signature_hex.is_empty() {
        return Err(SignatureError::Missing);
    }
    let bytes = hex::decode(signature_hex)
        .map_err(|e| SignatureError::Malformed(format!("signature is not hex: {}", e)))?;
    let raw: [u8; 64] = bytes.as_slice().try_into().map_err(|_| {
        SignatureError::Malformed(format!("signature must be 64 bytes, got {}", bytes.len()))
    })?;
    Ok(Signature::from_bytes(&raw))
}

pub fn verify_bytes(
    public_key: &VerifyingKey,
    canonical: &[u8],
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let signature = parse_signature(signature_hex)?;
    public_key
        .verify(&digest(canonical), &signature)
        .map_err(|_| SignatureError::Invalid)
}

pub fn verify(
    public_key: &VerifyingKey,
    plan: &TaskPlan,
    signature_hex: &str,
) -> Result<(), SignatureError> {
    let canonical = to_canonical_bytes(plan)
        .map_err(|e| SignatureError::Malformed(format!("plan cannot be encoded: {}", e)))?;
    verify_bytes(public_key, &canonical, signature_hex)
}

/// 签名信封：规范化载荷 + 签名方地址 + 签名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub payload: String,
    pub signer_address: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn seal(identity: &Identity, plan: &TaskPlan) -> Result<Self, GateError> {
        let canonical =
            to_canonical_bytes(plan).map_err(|e| GateError::InvalidPlan(e.to_string()))?;
        let signature = sign_bytes(identity, &canonical);
        let payload =
            String::from_utf8(canonical).map_err(|e| GateError::InvalidPlan(e.to_string()))?;
        Ok(Self {
            payload,
            signer_address: identity.address().to_string(),
            signature,
        })
    }

    /// 用受信公钥校验并解出计划
    ///
    /// 顺序：签名格式 → 签名方地址必须与受信公钥一致 → 验签 → 载荷必须是规范形式。
    pub fn open(&self, trusted: &VerifyingKey) -> Result<TaskPlan, SignatureError> {
        parse_signature(&self.signature)?;
        if address_of(trusted) != self.signer_address {
            return Err(SignatureError::Invalid);
        }
        verify_bytes(trusted, self.payload.as_bytes(), &self.signature)?;
        from_canonical_bytes(self.payload.as_bytes())
    }
}
