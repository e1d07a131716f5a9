//! Storage configuration.

use std::path::PathBuf;
use std::sync::Arc;

use gate_types::{ImageError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::prepare::{PreparedInstances, PreparedPrograms};
use crate::storage::{Filesystem, InstanceStorage, Memory, PersistentMemory, ProgramStorage, Storage};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageKind {
    /// Nothing is persisted.
    #[default]
    Memory,
    /// Programs and instances are files under the root directory.
    Filesystem,
    /// Programs are files under the root directory; instances live in
    /// memory and are copied there when stored.
    PersistentMemory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Directory containing the `program` and `instance` directories.
    pub root: Option<PathBuf>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Number of program files to create in advance.  Zero disables.
    pub prepare_programs: usize,
    /// Number of instance files to create in advance.  Zero disables.
    pub prepare_instances: usize,
}

impl StorageConfig {
    pub fn from_json(json: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Open the configured storage.  Files are not prepared in advance.
    pub fn open(&self) -> Result<Storage> {
        let (programs, instances) = self.backends()?;
        Ok(Storage::new(programs, instances))
    }

    /// Open the configured storage with file preparation.  Must be called
    /// within a Tokio runtime.
    pub fn open_prepared(&self, cancel: watch::Receiver<bool>) -> Result<Storage> {
        let (mut programs, mut instances) = self.backends()?;

        if self.prepare_programs > 0 {
            programs = Arc::new(PreparedPrograms::new(programs, self.prepare_programs, cancel.clone())?);
        }
        if self.prepare_instances > 0 {
            instances = Arc::new(PreparedInstances::new(instances, self.prepare_instances, cancel)?);
        }

        Ok(Storage::new(programs, instances))
    }

    fn backends(&self) -> Result<(Arc<dyn ProgramStorage>, Arc<dyn InstanceStorage>)> {
        debug!(kind = ?self.kind, root = ?self.root, "opening storage");

        match self.kind {
            StorageKind::Memory => Ok((Arc::new(Memory), Arc::new(Memory))),

            StorageKind::Filesystem => {
                let fs = Arc::new(self.filesystem()?);
                Ok((fs.clone(), fs))
            }

            StorageKind::PersistentMemory => {
                let fs = Arc::new(self.filesystem()?);
                Ok((fs.clone(), Arc::new(PersistentMemory::new(fs))))
            }
        }
    }

    fn filesystem(&self) -> Result<Filesystem> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| ImageError::internal(format!("{:?} storage requires a root directory", self.kind)))?;
        Filesystem::with_ownership(root, self.uid, self.gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config() {
        let c = StorageConfig::from_json(r#"{"kind": "persistent-memory", "root": "/var/lib/gate", "prepare_instances": 4}"#)
            .unwrap();
        assert_eq!(c.kind, StorageKind::PersistentMemory);
        assert_eq!(c.root, Some(PathBuf::from("/var/lib/gate")));
        assert_eq!(c.prepare_instances, 4);
        assert_eq!(c.prepare_programs, 0);
        assert_eq!(c.uid, None);

        assert_eq!(StorageConfig::from_json("{}").unwrap(), StorageConfig::default());
        assert!(StorageConfig::from_json(r#"{"kind": "tape"}"#).is_err());
    }

    #[test]
    fn json_round_trip() {
        let c = StorageConfig {
            kind: StorageKind::Filesystem,
            root: Some("/tmp/x".into()),
            gid: Some(100),
            ..Default::default()
        };
        assert_eq!(StorageConfig::from_json(&c.to_json().unwrap()).unwrap(), c);
    }

    #[test]
    fn filesystem_requires_root() {
        let c = StorageConfig {
            kind: StorageKind::Filesystem,
            ..Default::default()
        };
        assert!(c.open().is_err());
    }

    #[test]
    fn open_backends() {
        let dir = tempfile::tempdir().unwrap();
        let c = StorageConfig {
            kind: StorageKind::PersistentMemory,
            root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let storage = c.open().unwrap();
        assert!(storage.instance_storage().store_instance_supported());
        assert!(storage.programs().unwrap().is_empty());
        assert!(dir.path().join("instance").is_dir());

        let storage = StorageConfig::default().open().unwrap();
        assert!(!storage.instance_storage().store_instance_supported());
    }
}
