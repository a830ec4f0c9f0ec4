//! Registry of peer devices that have contacted this node.
//!
//! A record is created on the first verified command from an identity and
//! is only ever removed explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::info;

use zlink_security::PermissionLevel;

use crate::errors::CoreError;
use crate::store::Store;

/// Approval status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Approved,
    Blocked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Approved => "approved",
            DeviceStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeviceStatus::Pending),
            "approved" => Some(DeviceStatus::Approved),
            "blocked" => Some(DeviceStatus::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub identity: String,
    pub status: DeviceStatus,
    pub permission_level: PermissionLevel,
    pub trusted: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn is_blocked(&self) -> bool {
        self.status == DeviceStatus::Blocked
    }
}

/// Short stable id for an identity: first 16 hex chars of its SHA-256.
pub fn device_id_for(identity: &str) -> String {
    let digest = Sha256::digest(identity.as_bytes());
    hex::encode(&digest[..8])
}

/// Device registry backed by the store.
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
    first_contact_level: PermissionLevel,
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Store>, first_contact_level: PermissionLevel) -> Self {
        Self {
            store,
            first_contact_level,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Load persisted devices into memory.
    pub async fn load(&self) -> Result<usize, CoreError> {
        let records = self.store.load_devices().await?;
        let mut devices = self.devices.write().await;
        for record in records {
            devices.insert(record.device_id.clone(), record);
        }
        Ok(devices.len())
    }

    /// The record a command from `identity` is judged by. Unknown identities
    /// get an unsaved first-contact record; nothing is stored.
    pub async fn peek(&self, identity: &str) -> DeviceRecord {
        let device_id = device_id_for(identity);
        if let Some(existing) = self.devices.read().await.get(&device_id) {
            return existing.clone();
        }
        let now = Utc::now();
        DeviceRecord {
            device_id,
            identity: identity.to_string(),
            status: DeviceStatus::Pending,
            permission_level: self.first_contact_level,
            trusted: false,
            first_seen_at: now,
            last_seen_at: now,
        }
    }

    /// Record a verified contact from `identity`, creating the device on
    /// first contact.
    pub async fn observe(&self, identity: &str) -> Result<DeviceRecord, CoreError> {
        let device_id = device_id_for(identity);
        let now = Utc::now();
        let record = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&device_id) {
                Some(existing) => {
                    existing.last_seen_at = now;
                    existing.clone()
                }
                None => {
                    let record = DeviceRecord {
                        device_id: device_id.clone(),
                        identity: identity.to_string(),
                        status: DeviceStatus::Pending,
                        permission_level: self.first_contact_level,
                        trusted: false,
                        first_seen_at: now,
                        last_seen_at: now,
                    };
                    info!(device_id = %device_id, identity = %identity, "new device");
                    devices.insert(device_id.clone(), record.clone());
                    record
                }
            }
        };
        self.store.save_device(&record).await?;
        Ok(record)
    }

    /// Register or update a device ahead of first contact.
    pub async fn preauthorize(
        &self,
        identity: &str,
        level: PermissionLevel,
        trusted: bool,
    ) -> Result<DeviceRecord, CoreError> {
        let device_id = device_id_for(identity);
        let now = Utc::now();
        let record = {
            let mut devices = self.devices.write().await;
            let entry = devices.entry(device_id.clone()).or_insert_with(|| DeviceRecord {
                device_id: device_id.clone(),
                identity: identity.to_string(),
                status: DeviceStatus::Approved,
                permission_level: level,
                trusted,
                first_seen_at: now,
                last_seen_at: now,
            });
            entry.status = DeviceStatus::Approved;
            entry.permission_level = level;
            entry.trusted = trusted;
            entry.clone()
        };
        self.store.save_device(&record).await?;
        Ok(record)
    }

    pub async fn approve(&self, key: &str) -> Result<DeviceRecord, CoreError> {
        self.update(key, |d| d.status = DeviceStatus::Approved).await
    }

    pub async fn block(&self, key: &str) -> Result<DeviceRecord, CoreError> {
        self.update(key, |d| d.status = DeviceStatus::Blocked).await
    }

    pub async fn set_permission_level(&self, key: &str, level: PermissionLevel) -> Result<DeviceRecord, CoreError> {
        self.update(key, |d| d.permission_level = level).await
    }

    pub async fn set_trusted(&self, key: &str, trusted: bool) -> Result<DeviceRecord, CoreError> {
        self.update(key, |d| d.trusted = trusted).await
    }

    /// Explicitly forget a device.
    pub async fn remove(&self, key: &str) -> Result<DeviceRecord, CoreError> {
        let removed = {
            let mut devices = self.devices.write().await;
            let id = Self::resolve_id(&devices, key).ok_or_else(|| CoreError::NotFound(format!("device {}", key)))?;
            devices.remove(&id)
        };
        let record = removed.ok_or_else(|| CoreError::NotFound(format!("device {}", key)))?;
        self.store.remove_device(&record.device_id).await?;
        info!(device_id = %record.device_id, "device removed");
        Ok(record)
    }

    /// Look up by device id or identity.
    pub async fn get(&self, key: &str) -> Option<DeviceRecord> {
        let devices = self.devices.read().await;
        Self::resolve_id(&devices, key).and_then(|id| devices.get(&id).cloned())
    }

    pub async fn list(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<_> = self.devices.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.first_seen_at.cmp(&b.first_seen_at));
        list
    }

    async fn update<F>(&self, key: &str, mutate: F) -> Result<DeviceRecord, CoreError>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let record = {
            let mut devices = self.devices.write().await;
            let id = Self::resolve_id(&devices, key).ok_or_else(|| CoreError::NotFound(format!("device {}", key)))?;
            let device = devices
                .get_mut(&id)
                .ok_or_else(|| CoreError::NotFound(format!("device {}", key)))?;
            mutate(device);
            device.clone()
        };
        self.store.save_device(&record).await?;
        info!(
            device_id = %record.device_id,
            status = %record.status,
            level = %record.permission_level,
            trusted = record.trusted,
            "device updated"
        );
        Ok(record)
    }

    fn resolve_id(devices: &HashMap<String, DeviceRecord>, key: &str) -> Option<String> {
        if devices.contains_key(key) {
            return Some(key.to_string());
        }
        let id = device_id_for(key);
        devices.contains_key(&id).then_some(id)
    }
}
