//! Directory store: companies, devices, channels, membership edges.
//!
//! Durable records live in a single JSON file (same shape as the deployment
//! data file). The in-memory copy is read-mostly and safe for concurrent
//! reads; mutations take the write lock and persistence is serialized by a
//! single writer. A failed write surfaces as `StoreWrite` to the caller and
//! never corrupts the in-memory state.
//!
//! The coordinator only reads membership; all mutations arrive through the
//! REST boundary.

pub mod token;

use std::collections::HashSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::CoordinatorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub company_id: String,
    pub name: String,
    /// Five digits, unique within the company.
    pub account_number: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub company_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub channel_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DirectoryData {
    companies: Vec<Company>,
    devices: Vec<Device>,
    channels: Vec<Channel>,
    memberships: Vec<Membership>,
}

/// File-backed directory store.
pub struct DirectoryStore {
    path: PathBuf,
    data: RwLock<DirectoryData>,
    /// Serializes persistence; mutations to `data` happen before this is
    /// taken, so a failed write leaves memory intact.
    save_lock: Mutex<()>,
}

fn next_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", suffix.get(..8).unwrap_or("00000000"))
}

impl DirectoryStore {
    /// Open the store at `path`, creating an empty file when missing.
    pub async fn open(path: PathBuf) -> Result<Self, CoordinatorError> {
        let data = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                CoordinatorError::Internal(format!("directory file corrupt: {e}"))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "ptt.directory", path = %path.display(), "No directory file, starting empty");
                DirectoryData::default()
            }
            Err(e) => {
                return Err(CoordinatorError::Internal(format!(
                    "cannot read directory file: {e}"
                )))
            }
        };

        info!(
            target: "ptt.directory",
            path = %path.display(),
            companies = data.companies.len(),
            devices = data.devices.len(),
            channels = data.channels.len(),
            "Directory store loaded"
        );

        let store = Self {
            path,
            data: RwLock::new(data),
            save_lock: Mutex::new(()),
        };
        store.persist().await?;
        Ok(store)
    }

    /// Write the current snapshot to disk (tmp file + rename).
    async fn persist(&self) -> Result<(), CoordinatorError> {
        let snapshot = self.data.read().await.clone();
        let _guard = self.save_lock.lock().await;

        let raw = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CoordinatorError::StoreWrite(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|e| CoordinatorError::StoreWrite(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CoordinatorError::StoreWrite(e.to_string()))
    }

    // ---- companies ----

    pub async fn create_company(&self, name: &str) -> Result<Company, CoordinatorError> {
        let company = Company {
            id: next_id("co"),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.data.write().await.companies.push(company.clone());
        self.persist().await?;
        Ok(company)
    }

    pub async fn company(&self, id: &str) -> Option<Company> {
        self.data
            .read()
            .await
            .companies
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    // ---- devices ----

    pub async fn create_device(
        &self,
        company_id: &str,
        name: &str,
        password: &str,
    ) -> Result<Device, CoordinatorError> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| CoordinatorError::Internal(format!("password hash failed: {e}")))?;

        let device = {
            let mut data = self.data.write().await;
            if !data.companies.iter().any(|c| c.id == company_id) {
                return Err(CoordinatorError::DirectoryNotFound {
                    kind: "company",
                    id: company_id.to_string(),
                });
            }
            let account_number = generate_account_number(&data.devices, company_id);
            let device = Device {
                id: next_id("dev"),
                company_id: company_id.to_string(),
                name: name.to_string(),
                account_number,
                password_hash,
                created_at: Utc::now(),
            };
            data.devices.push(device.clone());
            device
        };
        self.persist().await?;
        Ok(device)
    }

    pub async fn device(&self, id: &str) -> Option<Device> {
        self.data
            .read()
            .await
            .devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// Verify an account number + password pair. Account numbers are unique
    /// per company only, so without a company id every candidate is checked
    /// against the password.
    pub async fn authenticate(
        &self,
        account_number: &str,
        company_id: Option<&str>,
        password: &str,
    ) -> Option<Device> {
        let candidates: Vec<Device> = self
            .data
            .read()
            .await
            .devices
            .iter()
            .filter(|d| {
                d.account_number == account_number
                    && company_id.map_or(true, |co| d.company_id == co)
            })
            .cloned()
            .collect();

        candidates
            .into_iter()
            .find(|d| bcrypt::verify(password, &d.password_hash).unwrap_or(false))
    }

    // ---- channels ----

    pub async fn create_channel(
        &self,
        company_id: &str,
        name: &str,
    ) -> Result<Channel, CoordinatorError> {
        let channel = {
            let mut data = self.data.write().await;
            if !data.companies.iter().any(|c| c.id == company_id) {
                return Err(CoordinatorError::DirectoryNotFound {
                    kind: "company",
                    id: company_id.to_string(),
                });
            }
            let channel = Channel {
                id: next_id("ch"),
                company_id: company_id.to_string(),
                name: name.to_string(),
                created_at: Utc::now(),
            };
            data.channels.push(channel.clone());
            channel
        };
        self.persist().await?;
        Ok(channel)
    }

    pub async fn channel(&self, id: &str) -> Option<Channel> {
        self.data
            .read()
            .await
            .channels
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    // ---- memberships ----

    pub async fn add_member(
        &self,
        channel_id: &str,
        device_id: &str,
    ) -> Result<(), CoordinatorError> {
        {
            let mut data = self.data.write().await;
            let channel = data
                .channels
                .iter()
                .find(|c| c.id == channel_id)
                .cloned()
                .ok_or(CoordinatorError::DirectoryNotFound {
                    kind: "channel",
                    id: channel_id.to_string(),
                })?;
            let device = data
                .devices
                .iter()
                .find(|d| d.id == device_id)
                .cloned()
                .ok_or(CoordinatorError::DirectoryNotFound {
                    kind: "device",
                    id: device_id.to_string(),
                })?;
            if device.company_id != channel.company_id {
                return Err(CoordinatorError::NotAuthorized(
                    "device and channel belong to different companies".to_string(),
                ));
            }
            let edge = Membership {
                channel_id: channel_id.to_string(),
                device_id: device_id.to_string(),
            };
            if data.memberships.contains(&edge) {
                return Err(CoordinatorError::Conflict(
                    "device is already a member".to_string(),
                ));
            }
            data.memberships.push(edge);
        }
        self.persist().await
    }

    pub async fn remove_member(
        &self,
        channel_id: &str,
        device_id: &str,
    ) -> Result<(), CoordinatorError> {
        {
            let mut data = self.data.write().await;
            let before = data.memberships.len();
            data.memberships
                .retain(|m| !(m.channel_id == channel_id && m.device_id == device_id));
            if data.memberships.len() == before {
                return Err(CoordinatorError::DirectoryNotFound {
                    kind: "membership",
                    id: format!("{channel_id}/{device_id}"),
                });
            }
        }
        self.persist().await
    }

    /// Authorization gate for join and for fan-out targeting.
    pub async fn is_member(&self, channel_id: &str, device_id: &str) -> bool {
        self.data
            .read()
            .await
            .memberships
            .iter()
            .any(|m| m.channel_id == channel_id && m.device_id == device_id)
    }

    /// Device ids with a membership edge to the channel.
    pub async fn members_of(&self, channel_id: &str) -> HashSet<String> {
        self.data
            .read()
            .await
            .memberships
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .map(|m| m.device_id.clone())
            .collect()
    }
}

/// Five random digits, unique among the company's devices.
fn generate_account_number(devices: &[Device], company_id: &str) -> String {
    let used: HashSet<&str> = devices
        .iter()
        .filter(|d| d.company_id == company_id)
        .map(|d| d.account_number.as_str())
        .collect();

    let mut rng = rand::thread_rng();
    loop {
        let candidate = rng.gen_range(10_000..100_000u32).to_string();
        if !used.contains(candidate.as_str()) {
            return candidate;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn temp_store() -> DirectoryStore {
        let path = std::env::temp_dir().join(format!("ptt-directory-{}.json", Uuid::new_v4()));
        DirectoryStore::open(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = temp_store().await;
        let company = store.create_company("Acme Logistics").await.unwrap();
        let device = store
            .create_device(&company.id, "Truck 7", "hunter2")
            .await
            .unwrap();
        let channel = store.create_channel(&company.id, "dispatch").await.unwrap();

        assert_eq!(store.company(&company.id).await.unwrap().name, "Acme Logistics");
        assert_eq!(store.device(&device.id).await.unwrap().name, "Truck 7");
        assert_eq!(store.channel(&channel.id).await.unwrap().company_id, company.id);
        assert_eq!(device.account_number.len(), 5);
    }

    #[tokio::test]
    async fn test_membership_gate() {
        let store = temp_store().await;
        let company = store.create_company("Acme").await.unwrap();
        let device = store.create_device(&company.id, "d1", "pw").await.unwrap();
        let channel = store.create_channel(&company.id, "ops").await.unwrap();

        assert!(!store.is_member(&channel.id, &device.id).await);
        store.add_member(&channel.id, &device.id).await.unwrap();
        assert!(store.is_member(&channel.id, &device.id).await);
        assert!(store.members_of(&channel.id).await.contains(&device.id));

        // Duplicate edge is a conflict.
        assert!(matches!(
            store.add_member(&channel.id, &device.id).await,
            Err(CoordinatorError::Conflict(_))
        ));

        store.remove_member(&channel.id, &device.id).await.unwrap();
        assert!(!store.is_member(&channel.id, &device.id).await);
    }

    #[tokio::test]
    async fn test_membership_rejects_cross_company() {
        let store = temp_store().await;
        let acme = store.create_company("Acme").await.unwrap();
        let globex = store.create_company("Globex").await.unwrap();
        let device = store.create_device(&globex.id, "d1", "pw").await.unwrap();
        let channel = store.create_channel(&acme.id, "ops").await.unwrap();

        assert!(matches!(
            store.add_member(&channel.id, &device.id).await,
            Err(CoordinatorError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = temp_store().await;
        let company = store.create_company("Acme").await.unwrap();
        let device = store
            .create_device(&company.id, "d1", "correct horse")
            .await
            .unwrap();

        let found = store
            .authenticate(&device.account_number, None, "correct horse")
            .await;
        assert_eq!(found.map(|d| d.id), Some(device.id.clone()));

        assert!(store
            .authenticate(&device.account_number, None, "wrong")
            .await
            .is_none());
        assert!(store
            .authenticate(&device.account_number, Some("co_other"), "correct horse")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_reload_round_trip() {
        let path = std::env::temp_dir().join(format!("ptt-directory-{}.json", Uuid::new_v4()));
        let company_id = {
            let store = DirectoryStore::open(path.clone()).await.unwrap();
            store.create_company("Acme").await.unwrap().id
        };

        let reloaded = DirectoryStore::open(path).await.unwrap();
        assert!(reloaded.company(&company_id).await.is_some());
    }

    #[test]
    fn test_account_numbers_unique_per_company() {
        let devices: Vec<Device> = (0..50)
            .map(|i| Device {
                id: format!("dev_{i}"),
                company_id: "co_1".to_string(),
                name: format!("d{i}"),
                account_number: (10_000 + i).to_string(),
                password_hash: String::new(),
                created_at: Utc::now(),
            })
            .collect();

        let fresh = generate_account_number(&devices, "co_1");
        assert!(devices.iter().all(|d| d.account_number != fresh));
        assert_eq!(fresh.len(), 5);
    }
}
