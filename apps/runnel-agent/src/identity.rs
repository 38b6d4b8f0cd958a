//! Persisted agent identity: issued once at registration, read on every
//! `run` start. Plain JSON on disk; the file should be root-readable only,
//! like any credential file.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_IDENTITY_PATH: &str = "/etc/runnel-agent/identity.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub server_url: String,
    pub machine_id: String,
    pub secret: String,
    pub name: String,
}

impl AgentIdentity {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading identity file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing identity file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("writing identity file {}", path.display()))
    }
}
