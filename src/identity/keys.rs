//! Ed25519 身份：密钥对 + 由公钥派生的稳定地址
//!
//! 地址 = SHA-256(公钥 32 字节) 的前 20 字节小写十六进制（40 字符）。
//! 密钥对可持久化到目录：`private.hex`（32 字节种子）与 `public.hex`。

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::error::{GateError, PairingError};

const PRIVATE_KEY_FILE: &str = "private.hex";
const PUBLIC_KEY_FILE: &str = "public.hex";

/// 签名身份，生成后不可变
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: String,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// 从 32 字节私钥种子的十六进制恢复
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, PairingError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| PairingError::InvalidKey(format!("secret is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            PairingError::InvalidKey(format!("secret must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// 目录中已有 `private.hex` 则加载，否则生成新密钥对并写入
    pub fn load_or_generate(dir: &Path) -> Result<Self, GateError> {
        let private_path = dir.join(PRIVATE_KEY_FILE);
        if private_path.exists() {
            let secret = std::fs::read_to_string(&private_path).map_err(|e| {
                GateError::KeyStorage(format!("read {}: {}", private_path.display(), e))
            })?;
            let identity = Self::from_secret_hex(&secret)?;
            tracing::info!(address = %identity.address(), "Loaded identity from {}", dir.display());
            return Ok(identity);
        }

        std::fs::create_dir_all(dir)
            .map_err(|e| GateError::KeyStorage(format!("create {}: {}", dir.display(), e)))?;
        let identity = Self::generate();
        std::fs::write(&private_path, hex::encode(identity.signing_key.to_bytes()))
            .map_err(|e| GateError::KeyStorage(format!("write {}: {}", private_path.display(), e)))?;
        let public_path = dir.join(PUBLIC_KEY_FILE);
        std::fs::write(&public_path, identity.public_key_hex())
            .map_err(|e| GateError::KeyStorage(format!("write {}: {}", public_path.display(), e)))?;
        tracing::info!(address = %identity.address(), "Generated new identity in {}", dir.display());
        Ok(identity)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(&signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }

    /// 对任意字节签名（协议层只签 32 字节摘要）
    pub fn sign_bytes(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// 公钥 → 地址
pub fn address_of(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..20])
}

/// 解析 64 位十六进制公钥，必须是合法的 Ed25519 点
pub fn parse_public_key(public_key_hex: &str) -> Result<VerifyingKey, PairingError> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| PairingError::InvalidKey(format!("public key is not hex: {}", e)))?;
    let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        PairingError::InvalidKey(format!("public key must be 32 bytes, got {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| PairingError::InvalidKey(format!("not an Ed25519 point: {}", e)))
}
