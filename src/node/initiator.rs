//! Node initiator name, read from the open-iscsi configuration.

use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// First `InitiatorName = value` entry of an initiator name file.
pub fn parse_initiator_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == "InitiatorName").then(|| value.trim().to_string())
    })
}

pub async fn read_initiator_name(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_initiator_name(&content).ok_or_else(|| {
        Error::Internal(format!("InitiatorName key is missing from {}", path.display()))
    })
}
