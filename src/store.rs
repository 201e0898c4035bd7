// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Config store and secret store external collaborators (§6). Both are out
//! of scope as *products* (a real deployment backs these with a
//! property-list database and a platform keychain) but the interfaces are
//! in scope: the daemon depends on them, so it must be driven by a trait,
//! not a concrete database type. Default implementations here are a flat
//! YAML file and an in-memory map, good enough to run and test the daemon
//! end-to-end without a real secret store installed.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::Digest;

/// Whether a target's configuration was entered by hand or discovered via
/// SendTargets (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetConfigType {
    Static,
    #[serde(rename = "dynamic-sendtargets")]
    DynamicSendTargets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRecord {
    pub max_connections: u16,
    pub error_recovery_level: u8,
    pub header_digest: Digest,
    pub data_digest: Digest,
    pub auth_method: String,
    pub auto_login: bool,
    pub config_type: TargetConfigType,
    /// Portals this target is reachable through, in the order `login`'s
    /// Target-only form (no `-p`) should try them (§4.G func_code 1).
    #[serde(default)]
    pub portals: Vec<PortalRecord>,
}

/// One of a target's known portals, as persisted in the static database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalRecord {
    pub address: String,
    pub port: String,
    #[serde(default)]
    pub host_interface: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryPortalRecord {
    pub address: String,
    pub port: String,
    pub host_interface: String,
    pub enabled: bool,
    pub interval_seconds: u64,
}

/// Accessors the core calls on the on-disk configuration database (§6).
pub trait ConfigStore: Send + Sync {
    fn initiator_iqn(&self) -> Result<String>;
    fn initiator_alias(&self) -> Result<String>;

    fn target(&self, iqn: &str) -> Result<Option<TargetRecord>>;
    fn upsert_target(&self, iqn: &str, record: TargetRecord) -> Result<()>;
    fn remove_target(&self, iqn: &str) -> Result<()>;
    fn all_targets(&self) -> Result<Vec<(String, TargetRecord)>>;

    fn discovery_portals(&self) -> Result<Vec<DiscoveryPortalRecord>>;

    /// Flush/reload (§5: "accessed only between runloop ticks;
    /// `synchronize()` is called before and after each transactional
    /// change").
    fn synchronize(&self) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileBacked {
    initiator_iqn: String,
    #[serde(default)]
    initiator_alias: String,
    #[serde(default)]
    targets: HashMap<String, TargetRecord>,
    #[serde(default)]
    discovery_portals: Vec<DiscoveryPortalRecord>,
}

/// Default `ConfigStore`: a single YAML file, read on `synchronize()` and
/// rewritten whole on every mutation. Adequate for a single daemon process;
/// not a concurrent multi-writer database.
pub struct FileConfigStore {
    path: PathBuf,
    state: RwLock<FileBacked>,
}

impl FileConfigStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let s = fs::read_to_string(&path)
                .with_context(|| format!("reading config store {}", path.display()))?;
            serde_yaml::from_str(&s).context("parsing config store YAML")?
        } else {
            FileBacked::default()
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn persist(&self, state: &FileBacked) -> Result<()> {
        let s = serde_yaml::to_string(state).context("serializing config store")?;
        fs::write(&self.path, s)
            .with_context(|| format!("writing config store {}", self.path.display()))
    }
}

impl ConfigStore for FileConfigStore {
    fn initiator_iqn(&self) -> Result<String> {
        Ok(self.state.read().expect("lock poisoned").initiator_iqn.clone())
    }

    fn initiator_alias(&self) -> Result<String> {
        Ok(self.state.read().expect("lock poisoned").initiator_alias.clone())
    }

    fn target(&self, iqn: &str) -> Result<Option<TargetRecord>> {
        Ok(self.state.read().expect("lock poisoned").targets.get(iqn).cloned())
    }

    fn upsert_target(&self, iqn: &str, record: TargetRecord) -> Result<()> {
        let mut guard = self.state.write().expect("lock poisoned");
        guard.targets.insert(iqn.to_string(), record);
        self.persist(&guard)
    }

    fn remove_target(&self, iqn: &str) -> Result<()> {
        let mut guard = self.state.write().expect("lock poisoned");
        guard.targets.remove(iqn);
        self.persist(&guard)
    }

    fn all_targets(&self) -> Result<Vec<(String, TargetRecord)>> {
        Ok(self
            .state
            .read()
            .expect("lock poisoned")
            .targets
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn discovery_portals(&self) -> Result<Vec<DiscoveryPortalRecord>> {
        Ok(self.state.read().expect("lock poisoned").discovery_portals.clone())
    }

    fn synchronize(&self) -> Result<()> {
        if self.path.exists() {
            let s = fs::read_to_string(&self.path)
                .with_context(|| format!("reading config store {}", self.path.display()))?;
            let fresh: FileBacked =
                serde_yaml::from_str(&s).context("parsing config store YAML")?;
            *self.state.write().expect("lock poisoned") = fresh;
        }
        Ok(())
    }
}

/// `get_chap_secret`/`set_chap_secret`/`delete_chap_secret`/`rename_node`
/// (§6). The core only ever passes node IQNs; the real store handles
/// OS-level privilege separation (Keychain ACLs, etc.) which is out of
/// scope here.
pub trait SecretStore: Send + Sync {
    fn get_chap_secret(&self, node_iqn: &str) -> Result<Option<String>>;
    fn set_chap_secret(&self, node_iqn: &str, secret: &str) -> Result<()>;
    fn delete_chap_secret(&self, node_iqn: &str) -> Result<()>;
    fn rename_node(&self, old_iqn: &str, new_iqn: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl SecretStore for InMemorySecretStore {
    fn get_chap_secret(&self, node_iqn: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().expect("lock poisoned").get(node_iqn).cloned())
    }

    fn set_chap_secret(&self, node_iqn: &str, secret: &str) -> Result<()> {
        self.secrets
            .write()
            .expect("lock poisoned")
            .insert(node_iqn.to_string(), secret.to_string());
        Ok(())
    }

    fn delete_chap_secret(&self, node_iqn: &str) -> Result<()> {
        self.secrets.write().expect("lock poisoned").remove(node_iqn);
        Ok(())
    }

    fn rename_node(&self, old_iqn: &str, new_iqn: &str) -> Result<()> {
        let mut guard = self.secrets.write().expect("lock poisoned");
        if let Some(secret) = guard.remove(old_iqn) {
            guard.insert(new_iqn.to_string(), secret);
        }
        Ok(())
    }
}

pub fn default_store_path(file_name: &str) -> PathBuf {
    Path::new("docker").join(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_config_store_round_trips_target_records() {
        let dir = std::env::temp_dir().join(format!(
            "iscsi-client-rs-test-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config_store.yaml");
        let _ = fs::remove_file(&path);

        let store = FileConfigStore::open(&path).unwrap();
        store
            .upsert_target(
                "iqn.2015-01.com.example:tgt0",
                TargetRecord {
                    max_connections: 1,
                    error_recovery_level: 0,
                    header_digest: Digest::None,
                    data_digest: Digest::None,
                    auth_method: "None".to_string(),
                    auto_login: true,
                    config_type: TargetConfigType::Static,
                    portals: Vec::new(),
                },
            )
            .unwrap();

        let reopened = FileConfigStore::open(&path).unwrap();
        let rec = reopened.target("iqn.2015-01.com.example:tgt0").unwrap().unwrap();
        assert_eq!(rec.max_connections, 1);
        assert!(rec.auto_login);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn in_memory_secret_store_rename_moves_secret() {
        let store = InMemorySecretStore::default();
        store.set_chap_secret("iqn.old", "s3cret").unwrap();
        store.rename_node("iqn.old", "iqn.new").unwrap();
        assert_eq!(store.get_chap_secret("iqn.old").unwrap(), None);
        assert_eq!(
            store.get_chap_secret("iqn.new").unwrap(),
            Some("s3cret".to_string())
        );
    }
}
