use super::GatewaySnapshot;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing::{debug, info};

const SNAPSHOT_EXTENSION: &str = "toml";

/// TOML snapshot files, one per gateway.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the snapshot for `gateway_sn`. Characters that cannot appear in a
    /// file name are replaced with `_`.
    pub fn path_for(&self, gateway_sn: &str) -> PathBuf {
        let file_name: String = gateway_sn
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir
            .join(format!("{}.{}", file_name, SNAPSHOT_EXTENSION))
    }

    /// Loads a snapshot. `Ok(None)` when the gateway was never saved.
    pub async fn load(&self, gateway_sn: &str) -> Result<Option<GatewaySnapshot>> {
        let path = self.path_for(gateway_sn);

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check snapshot {}: {}", path.display(), e))?
        {
            debug!("No snapshot for gateway {}", gateway_sn);
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read snapshot {}: {}", path.display(), e))?;

        let snapshot: GatewaySnapshot = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse snapshot {}: {}", path.display(), e))?;

        if snapshot.gateway_sn != gateway_sn {
            return Err(eyre!(
                "Snapshot {} belongs to gateway {}",
                path.display(),
                snapshot.gateway_sn
            ));
        }

        debug!(
            "Loaded snapshot for gateway {} ({} devices)",
            gateway_sn,
            snapshot.devices.len()
        );
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &GatewaySnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;

        let content = toml::to_string_pretty(snapshot)
            .map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

        let path = self.path_for(&snapshot.gateway_sn);
        let staging = path.with_extension("toml.tmp");
        tokio::fs::write(&staging, content)
            .await
            .map_err(|e| eyre!("Failed to write snapshot {}: {}", staging.display(), e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| eyre!("Failed to replace snapshot {}: {}", path.display(), e))?;

        debug!("Snapshot saved for gateway {}", snapshot.gateway_sn);
        Ok(())
    }

    /// Removes the snapshot. A missing file is not an error.
    pub async fn delete(&self, gateway_sn: &str) -> Result<()> {
        let path = self.path_for(gateway_sn);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Snapshot deleted for gateway {}", gateway_sn);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(eyre!("Failed to delete snapshot {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DeviceRecord;

    fn snapshot() -> GatewaySnapshot {
        GatewaySnapshot {
            gateway_sn: "SN123".to_string(),
            name: Some("Roof".to_string()),
            bound: true,
            next_ordinal: 4,
            devices: vec![
                DeviceRecord {
                    device_id: "D-B".to_string(),
                    ordinal: 2,
                    travel: Some(100),
                },
                DeviceRecord {
                    device_id: "D-C".to_string(),
                    ordinal: 3,
                    travel: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());

        store.save(&snapshot()).await.unwrap();
        let loaded = store.load("SN123").await.unwrap();
        assert_eq!(loaded, Some(snapshot()));
    }

    #[tokio::test]
    async fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("not-yet-created"));

        assert_eq!(store.load("SN123").await.unwrap(), None);
        store.delete("SN123").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        tokio::fs::write(store.path_for("SN123"), "next_ordinal = [")
            .await
            .unwrap();

        assert!(store.load("SN123").await.is_err());
    }

    #[test]
    fn serial_is_sanitized_for_file_names() {
        let store = SnapshotStore::new("/var/lib/openerbridge");
        assert_eq!(
            store.path_for("../GW 01"),
            PathBuf::from("/var/lib/openerbridge/___GW_01.toml")
        );
    }
}
