//! Share registry
//!
//! Process-wide answer to "is this bus id shared, and who has it". Shares
//! are persisted through a [`ShareStore`] keyed by a stable GUID; attach
//! state is transient and never written out. Readers run concurrently,
//! writers serialize on the record lock, and `mark_attached` is the
//! atomicity point that makes two racing imports resolve to exactly one
//! winner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use common::{Error, Result};
use protocol::BusId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// A share as it is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedShare {
    pub guid: Uuid,
    pub bus_id: BusId,
    pub friendly_name: String,
}

/// A share with its transient attach state
#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub bus_id: BusId,
    pub guid: Uuid,
    pub friendly_name: String,
    pub attached_to: Option<SocketAddr>,
}

/// Persistence backend for shares
pub trait ShareStore: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedShare>>;
    fn save(&self, shares: &[PersistedShare]) -> Result<()>;
}

/// Volatile store for tests and the emulated mode
#[derive(Default)]
pub struct MemoryStore {
    shares: Mutex<Vec<PersistedShare>>,
}

impl ShareStore for MemoryStore {
    fn load(&self) -> Result<Vec<PersistedShare>> {
        Ok(self.shares.lock().unwrap().clone())
    }

    fn save(&self, shares: &[PersistedShare]) -> Result<()> {
        *self.shares.lock().unwrap() = shares.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShareFile {
    #[serde(default)]
    shares: Vec<PersistedShare>,
}

/// TOML-file-backed store, the host's persistent share table
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ShareStore for FileStore {
    fn load(&self) -> Result<Vec<PersistedShare>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let file: ShareFile = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("share file {}: {}", self.path.display(), e)))?;
        Ok(file.shares)
    }

    fn save(&self, shares: &[PersistedShare]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ShareFile {
            shares: shares.to_vec(),
        };
        let raw = toml::to_string_pretty(&file)
            .map_err(|e| Error::Config(format!("serializing shares: {}", e)))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

/// The process-wide share table
pub struct ShareRegistry {
    store: Box<dyn ShareStore>,
    records: RwLock<HashMap<BusId, ShareRecord>>,
}

impl ShareRegistry {
    /// Load persisted shares from the store
    pub fn open(store: Box<dyn ShareStore>) -> Result<Self> {
        let records = store
            .load()?
            .into_iter()
            .map(|share| {
                (
                    share.bus_id.clone(),
                    ShareRecord {
                        bus_id: share.bus_id,
                        guid: share.guid,
                        friendly_name: share.friendly_name,
                        attached_to: None,
                    },
                )
            })
            .collect();
        Ok(Self {
            store,
            records: RwLock::new(records),
        })
    }

    pub fn is_shared(&self, bus_id: &BusId) -> bool {
        self.records.read().unwrap().contains_key(bus_id)
    }

    /// All shares, ordered by bus id
    pub fn all_shared(&self) -> Vec<ShareRecord> {
        let mut shares: Vec<ShareRecord> =
            self.records.read().unwrap().values().cloned().collect();
        shares.sort_by(|a, b| a.bus_id.as_str().cmp(b.bus_id.as_str()));
        shares
    }

    /// Claim the single attachment slot for this bus id
    pub fn mark_attached(&self, bus_id: &BusId, client: SocketAddr) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let record = records
            .get_mut(bus_id)
            .ok_or_else(|| Error::NotShared(bus_id.to_string()))?;
        if record.attached_to.is_some() {
            return Err(Error::AlreadyAttached(bus_id.to_string()));
        }
        record.attached_to = Some(client);
        info!(%bus_id, %client, "device attached");
        Ok(())
    }

    pub fn mark_detached(&self, bus_id: &BusId) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(bus_id) {
            if record.attached_to.take().is_some() {
                info!(%bus_id, "device detached");
            }
        }
    }

    pub fn attached_to(&self, bus_id: &BusId) -> Option<SocketAddr> {
        self.records
            .read()
            .unwrap()
            .get(bus_id)
            .and_then(|r| r.attached_to)
    }

    /// Mark a bus id shared; idempotent, returns the share's GUID
    pub fn bind(&self, bus_id: BusId, friendly_name: String) -> Result<Uuid> {
        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get(&bus_id) {
            return Ok(existing.guid);
        }
        let guid = Uuid::new_v4();
        records.insert(
            bus_id.clone(),
            ShareRecord {
                bus_id: bus_id.clone(),
                guid,
                friendly_name,
                attached_to: None,
            },
        );
        Self::persist(&*self.store, &records)?;
        debug!(%bus_id, %guid, "share bound");
        Ok(guid)
    }

    /// Remove a share by bus id; `Ok(false)` when it was not shared
    pub fn unbind(&self, bus_id: &BusId) -> Result<bool> {
        let mut records = self.records.write().unwrap();
        let removed = records.remove(bus_id).is_some();
        if removed {
            Self::persist(&*self.store, &records)?;
            debug!(%bus_id, "share unbound");
        }
        Ok(removed)
    }

    /// Remove a share by its GUID
    pub fn unbind_guid(&self, guid: &Uuid) -> Result<Option<BusId>> {
        let mut records = self.records.write().unwrap();
        let bus_id = records
            .values()
            .find(|r| &r.guid == guid)
            .map(|r| r.bus_id.clone());
        if let Some(ref id) = bus_id {
            records.remove(id);
            Self::persist(&*self.store, &records)?;
            debug!(bus_id = %id, %guid, "share unbound");
        }
        Ok(bus_id)
    }

    /// Remove every share, returning how many were dropped
    pub fn unbind_all(&self) -> Result<usize> {
        let mut records = self.records.write().unwrap();
        let count = records.len();
        records.clear();
        Self::persist(&*self.store, &records)?;
        Ok(count)
    }

    fn persist(store: &dyn ShareStore, records: &HashMap<BusId, ShareRecord>) -> Result<()> {
        let mut shares: Vec<PersistedShare> = records
            .values()
            .map(|r| PersistedShare {
                guid: r.guid,
                bus_id: r.bus_id.clone(),
                friendly_name: r.friendly_name.clone(),
            })
            .collect();
        shares.sort_by(|a, b| a.bus_id.as_str().cmp(b.bus_id.as_str()));
        store.save(&shares)
    }
}
