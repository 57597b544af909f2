//! Durable storage for the cluster configuration.
//!
//! The configuration is written to a single file:
//!
//! ```text
//! +-------+----------------+-------------+------------------+
//! | magic | format version | crc32(body) | bincode(body)    |
//! | 4 B   | u32 BE         | u32 BE      | ...              |
//! +-------+----------------+-------------+------------------+
//! ```
//!
//! Writes go to a temporary file that is synced and then renamed over the
//! target, so a crash leaves either the old or the new configuration.
use crate::configuration::ClusterConfiguration;
use crate::error::{TopologyError, TopologyResult};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const MAGIC: &[u8; 4] = b"CTOP";

const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 12;

/// Encode a configuration into the on-disk format.
pub fn encode(config: &ClusterConfiguration) -> TopologyResult<Vec<u8>> {
    let body = bincode::serialize(config)?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Decode a configuration from the on-disk format.
pub fn decode(bytes: &[u8]) -> TopologyResult<ClusterConfiguration> {
    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(TopologyError::Storage(
            "Not a cluster configuration file".to_string(),
        ));
    }
    let version = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(TopologyError::Storage(format!(
            "Incompatible configuration file version: {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let checksum = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let body = &bytes[HEADER_LEN..];
    if crc32fast::hash(body) != checksum {
        return Err(TopologyError::Storage(
            "Configuration file checksum mismatch".to_string(),
        ));
    }
    Ok(bincode::deserialize(body)?)
}

/// Save the configuration to `path` atomically.
///
/// # Errors
///
/// Returns `TopologyError::Storage` if the directory cannot be created or
/// any write, sync or rename fails.
pub async fn save(config: &ClusterConfiguration, path: &Path) -> TopologyResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TopologyError::Storage(format!("Failed to create directory: {}", e)))?;
    }

    let bytes = encode(config)?;

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|e| TopologyError::Storage(format!("Failed to create temporary file: {}", e)))?;
    file.write_all(&bytes)
        .await
        .map_err(|e| TopologyError::Storage(format!("Failed to write temporary file: {}", e)))?;
    file.sync_all()
        .await
        .map_err(|e| TopologyError::Storage(format!("Failed to sync temporary file: {}", e)))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| TopologyError::Storage(format!("Failed to rename file: {}", e)))?;

    Ok(())
}

/// Load the configuration from `path`, or `None` if there is no file.
pub async fn load(path: &Path) -> TopologyResult<Option<ClusterConfiguration>> {
    match fs::read(path).await {
        Ok(bytes) => decode(&bytes).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TopologyError::Storage(format!(
            "Failed to read configuration file: {}",
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DynamicPartitionConfig, MemberState, PartitionState};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample() -> ClusterConfiguration {
        let mut partitions = BTreeMap::new();
        partitions.insert(1, PartitionState::active(2));
        let mut config = ClusterConfiguration::new(DynamicPartitionConfig::new(1, 1))
            .with_member("0", MemberState::active(partitions));
        config.version = 7;
        config
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.meta");

        save(&sample(), &path).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded = load(&dir.path().join("missing.meta")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corruption_is_detected() {
        let mut bytes = encode(&sample()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(decode(&bytes), Err(TopologyError::Storage(_))));
    }

    #[test]
    fn test_rejects_foreign_file() {
        assert!(matches!(
            decode(b"definitely not a configuration"),
            Err(TopologyError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_save_into_unwritable_location_fails() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"file").await.unwrap();

        let result = save(&sample(), &blocker.join("cluster.meta")).await;
        assert!(matches!(result, Err(TopologyError::Storage(_))));
    }
}
