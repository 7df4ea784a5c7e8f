use std::path::Path;

use tracing::debug;

use super::StoreState;
use crate::core::errors::Result;

const SNAPSHOT_KEY: &[u8] = b"snapshot";
const ZSTD_LEVEL: i32 = 3;

/// Durable snapshot backend: the whole store serialized as one compressed
/// document under a single sled key, flushed on every save.
pub(crate) struct SnapshotStore {
    db: sled::Db,
}

impl SnapshotStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn save(&self, state: &StoreState) -> Result<()> {
        let serialized = serde_json::to_vec(state)?;
        let compressed = zstd::encode_all(&serialized[..], ZSTD_LEVEL)?;
        debug!(
            raw_bytes = serialized.len(),
            compressed_bytes = compressed.len(),
            "writing store snapshot"
        );
        self.db.insert(SNAPSHOT_KEY, compressed)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreState>> {
        match self.db.get(SNAPSHOT_KEY)? {
            Some(compressed) => {
                let raw = zstd::decode_all(&compressed[..])?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }
}
