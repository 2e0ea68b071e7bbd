//! 配对注册表（执行端持有）
//!
//! 每个 `(owner_id, device_id)` 至多一条 `paired` 记录；记录里的公钥是被信任为该设备签计划的规划端公钥。
//! 同一公钥重复注册是幂等的（配对请求可能被重复投递），换公钥必须先 `revoke`。

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::keys::{address_of, parse_public_key};
use crate::core::error::PairingError;

/// 配对状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    /// 正在校验中的瞬态，`register` 返回时不会再处于该状态
    Pending,
    Paired,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingRecord {
    pub owner_id: String,
    pub device_id: String,
    pub public_key: String,
    pub capabilities: BTreeSet<String>,
    pub status: PairingStatus,
    pub paired_at: DateTime<Utc>,
}

impl PairingRecord {
    /// 受信签名方地址（由公钥派生）
    pub fn signer_address(&self) -> Result<String, PairingError> {
        Ok(address_of(&parse_public_key(&self.public_key)?))
    }

    pub fn is_active(&self) -> bool {
        self.status == PairingStatus::Paired
    }
}

type DeviceKey = (String, String);

/// 配对注册表
#[derive(Default)]
pub struct PairingRegistry {
    records: RwLock<HashMap<DeviceKey, PairingRecord>>,
}

impl PairingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        owner_id: &str,
        device_id: &str,
        public_key: &str,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<PairingRecord, PairingError> {
        let public_key = public_key.trim().to_lowercase();
        let mut record = PairingRecord {
            owner_id: owner_id.to_string(),
            device_id: device_id.to_string(),
            public_key,
            capabilities: capabilities.into_iter().collect(),
            status: PairingStatus::Pending,
            paired_at: Utc::now(),
        };
        parse_public_key(&record.public_key)?;

        let key = (owner_id.to_string(), device_id.to_string());
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&key) {
            if existing.is_active() {
                if existing.public_key == record.public_key {
                    tracing::debug!(owner = %owner_id, device = %device_id, "Idempotent re-pairing");
                    return Ok(existing.clone());
                }
                tracing::warn!(owner = %owner_id, device = %device_id, "Pairing rejected: already paired with another key");
                return Err(PairingError::AlreadyPaired {
                    owner_id: owner_id.to_string(),
                    device_id: device_id.to_string(),
                });
            }
        }

        record.status = PairingStatus::Paired;
        records.insert(key, record.clone());
        tracing::info!(owner = %owner_id, device = %device_id, "Device paired");
        Ok(record)
    }

    /// 返回该设备的当前记录（可能是已撤销的）
    pub async fn lookup(&self, owner_id: &str, device_id: &str) -> Option<PairingRecord> {
        self.records
            .read()
            .await
            .get(&(owner_id.to_string(), device_id.to_string()))
            .cloned()
    }

    pub async fn revoke(&self, owner_id: &str, device_id: &str) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&(owner_id.to_string(), device_id.to_string())) {
            if record.is_active() {
                record.status = PairingStatus::Revoked;
                tracing::info!(owner = %owner_id, device = %device_id, "Pairing revoked");
            }
        }
    }

    /// 下发前的准入检查：只有 `paired` 记录算数
    pub async fn require_paired(
        &self,
        owner_id: &str,
        device_id: &str,
    ) -> Result<PairingRecord, PairingError> {
        match self.lookup(owner_id, device_id).await {
            Some(record) if record.is_active() => Ok(record),
            _ => Err(PairingError::NotPaired {
                owner_id: owner_id.to_string(),
                device_id: device_id.to_string(),
            }),
        }
    }
}
