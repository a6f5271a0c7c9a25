use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::core::snapshot::ClusterInventory;
use crate::errors::CollectionError;

/// Source of node and guest inventory for one cluster.
#[async_trait]
pub trait SnapshotCollector: Send + Sync {
    async fn collect(&self, cluster: &str) -> Result<ClusterInventory, CollectionError>;
}

/// Reads `<dir>/<cluster>.json`, as written by an exporter on the cluster side.
#[derive(Debug, Clone)]
pub struct FileCollector {
    dir: PathBuf,
}

impl FileCollector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, cluster: &str) -> PathBuf {
        self.dir.join(format!("{}.json", cluster))
    }
}

#[async_trait]
impl SnapshotCollector for FileCollector {
    async fn collect(&self, cluster: &str) -> Result<ClusterInventory, CollectionError> {
        if cluster.is_empty() || cluster.contains(['/', '\\']) || cluster.contains("..") {
            return Err(CollectionError::Unavailable {
                cluster: cluster.to_string(),
                message: "invalid cluster name".to_string(),
                retryable: false,
            });
        }
        let path = self.path_for(cluster);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CollectionError::Unavailable {
                    cluster: cluster.to_string(),
                    message: format!("no inventory at {}", path.display()),
                    retryable: false,
                })
            }
            Err(e) => return Err(e.into()),
        };
        let inventory: ClusterInventory = serde_json::from_str(&raw)?;
        inventory.check()?;
        debug!(
            cluster,
            nodes = inventory.nodes.len(),
            guests = inventory.guests.len(),
            "Inventory collected"
        );
        Ok(inventory)
    }
}
