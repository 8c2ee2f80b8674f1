//! State file persistence. The document keeps full instance snapshots for
//! humans and UIs, but only `config` is read back: a restored registry never
//! claims a process is alive.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::error::PersistError;
use crate::group::{Group, GroupConfig};
use crate::instance::{Instance, InstanceSnapshot};

pub const STATE_VERSION: &str = "1.0";

fn default_version() -> String {
    STATE_VERSION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Local>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exported_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupDocument {
    #[serde(default)]
    pub group_config: GroupConfig,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSnapshot>,
}

impl StateDocument {
    pub fn from_groups<'a>(groups: impl IntoIterator<Item = &'a Group>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| {
                let instances = g
                    .instances()
                    .iter()
                    .map(|(id, inst)| (id.clone(), inst.snapshot()))
                    .collect();
                (
                    g.name().to_string(),
                    GroupDocument {
                        group_config: g.config.clone(),
                        instances,
                    },
                )
            })
            .collect();

        Self {
            version: default_version(),
            saved_at: None,
            exported_at: None,
            groups,
        }
    }

    /// Rebuilds groups from the document. Every instance comes back stopped.
    pub fn into_groups(self) -> BTreeMap<String, Group> {
        self.groups
            .into_iter()
            .map(|(name, doc)| (name.clone(), group_from_document(&name, doc)))
            .collect()
    }
}

pub(crate) fn group_from_document(name: &str, doc: GroupDocument) -> Group {
    let mut group = Group::new(name, doc.group_config);
    for (id, snapshot) in doc.instances {
        group.add(Instance::new(&id, snapshot.config));
    }
    group
}

/// Reads a state or export document from `path`.
pub fn read_document(path: &Path) -> Result<StateDocument, PersistError> {
    let content = fs::read_to_string(path).map_err(|e| PersistError::io(path, e))?;
    serde_json::from_str(&content).map_err(|source| PersistError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `doc` to `path` through a temp file in the same directory and a rename,
/// so a crash mid-write never leaves a truncated file behind.
pub fn write_document(path: &Path, doc: &StateDocument) -> Result<(), PersistError> {
    let content = serde_json::to_string_pretty(doc).map_err(PersistError::Serialize)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| PersistError::io(&dir, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| PersistError::io(&dir, e))?;
    tmp.write_all(content.as_bytes())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| PersistError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| PersistError::io(path, e.error))?;
    Ok(())
}

/// Backing state file of the registry.
#[derive(Debug, Clone)]
pub struct StateStore {
    file_path: PathBuf,
}

impl StateStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// `Ok(None)` when no state file exists yet.
    pub fn load(&self) -> Result<Option<BTreeMap<String, Group>>, PersistError> {
        if !self.file_path.exists() {
            tracing::info!("State file {} does not exist, starting empty", self.file_path.display());
            return Ok(None);
        }
        let groups = read_document(&self.file_path)?.into_groups();
        tracing::info!("Loaded {} groups from {}", groups.len(), self.file_path.display());
        Ok(Some(groups))
    }

    pub fn save<'a>(&self, groups: impl IntoIterator<Item = &'a Group>) -> Result<(), PersistError> {
        let mut doc = StateDocument::from_groups(groups);
        doc.saved_at = Some(Local::now());
        write_document(&self.file_path, &doc)?;
        tracing::debug!("Saved {} groups to {}", doc.groups.len(), self.file_path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceStatus, ProcessInfo};
    use serde_json::json;

    fn sample_group() -> Group {
        let mut group = Group::new("g1", GroupConfig::with_launch_interval(2));
        let cfg = json!({ "qq": "10001", "ports": { "api": 8001 } });
        group.add(Instance::new("b1", cfg.as_object().cloned().unwrap()));
        group.get_mut("b1").unwrap().start(ProcessInfo::with_pid(55));
        group
    }

    #[test]
    fn load_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_restores_config_but_not_status() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("nested").join("state.json"));
        let group = sample_group();
        store.save([&group]).unwrap();

        let groups = store.load().unwrap().unwrap();
        let restored = groups.get("g1").unwrap();
        assert_eq!(restored.config.launch_interval, Some(2));
        let inst = restored.get("b1").unwrap();
        assert_eq!(inst.config, group.get("b1").unwrap().config);
        assert_eq!(inst.status(), InstanceStatus::Stopped);
        assert!(inst.pid().is_none());
    }

    #[test]
    fn minimal_hand_written_document_loads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(
            &path,
            r#"{ "groups": { "g": { "instances": { "x": { "config": { "a": 1 } } } } } }"#,
        )
        .unwrap();

        let groups = StateStore::new(&path).load().unwrap().unwrap();
        assert_eq!(groups["g"].get("x").unwrap().config["a"], 1);
    }

    #[test]
    fn corrupt_file_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StateStore::new(&path).load(), Err(PersistError::Parse { .. })));
    }

    #[test]
    fn write_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path().join("state.json"));
        store.save([&sample_group()]).unwrap();
        store.save([&sample_group()]).unwrap();
        let entries: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
