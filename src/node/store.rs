//! Connection record store.
//!
//! One JSON file per attached volume under
//! `<kubelet_path>/plugins/<plugin_name>/iscsi-<volume_id>.json`. The file is
//! the only node-side record of an attachment and survives plugin restarts.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::domain::ports::Connector;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct ConnectorStore {
    dir: PathBuf,
}

impl ConnectorStore {
    pub fn new(kubelet_path: impl AsRef<Path>, plugin_name: &str) -> Self {
        Self {
            dir: kubelet_path.as_ref().join("plugins").join(plugin_name),
        }
    }

    pub fn path(&self, volume_id: &str) -> PathBuf {
        self.dir.join(format!("iscsi-{}.json", volume_id))
    }

    pub async fn exists(&self, volume_id: &str) -> bool {
        tokio::fs::try_exists(self.path(volume_id))
            .await
            .unwrap_or(false)
    }

    /// Write the record, replacing any previous one.
    ///
    /// The content goes to a sibling temporary file first so a crash never
    /// leaves a truncated record behind.
    pub async fn persist(&self, volume_id: &str, connector: &Connector) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path(volume_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(connector)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(path = %path.display(), "Connection record saved");
        Ok(path)
    }

    /// Read the record, `None` when there is none.
    pub async fn load(&self, volume_id: &str) -> Result<Option<Connector>> {
        let bytes = match tokio::fs::read(self.path(volume_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Delete the record; a missing record is not an error.
    pub async fn remove(&self, volume_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(volume_id)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
