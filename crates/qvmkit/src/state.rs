//! Persistent controller state.
//!
//! Everything the controller must remember across a restart to keep its
//! in-memory topology honest: the sandbox UUID, the bridge slot maps,
//! and the hot-plugged CPU/memory bookkeeping. The store writes after
//! every successful mutation, so a reattached controller always sees the
//! post-flow topology.

use camino::Utf8PathBuf;
use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bridge::Bridge;

const STATE_FILE: &str = "state.json";

/// Mutable controller state, serialized as JSON. Every field defaults so
/// that blobs written by older controller versions load cleanly; unknown
/// fields from newer versions are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Stable VM identity, generated once per sandbox lifetime.
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub bridges: Vec<Bridge>,
    /// Hot-added vCPU ids in add order; removal pops from the tail.
    #[serde(default)]
    pub hotplugged_vcpus: Vec<String>,
    /// Cumulative hot-added memory.
    #[serde(default)]
    pub hotplugged_memory_mib: u32,
    /// 0 when no daemon is running.
    #[serde(default)]
    pub virtiofsd_pid: u32,
    /// Snapshot of the config flag taken at init, so a restarted
    /// controller unplugs devices the way they were plugged.
    #[serde(default)]
    pub hotplug_vfio_on_root_bus: bool,
    #[serde(default)]
    pub nvdimm_count: u32,
}

/// Filesystem-backed store of [`ControllerState`], keyed by sandbox id.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: Utf8PathBuf,
}

impl StateStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn state_path(&self, sandbox_id: &str) -> Utf8PathBuf {
        self.root.join(sandbox_id).join(STATE_FILE)
    }

    /// Load the state for `sandbox_id`; `None` when never saved.
    pub fn load(&self, sandbox_id: &str) -> Result<Option<ControllerState>> {
        let path = self.state_path(sandbox_id);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading controller state {path}"))
            }
        };
        let state = serde_json::from_slice(&contents)
            .with_context(|| format!("decoding controller state {path}"))?;
        Ok(Some(state))
    }

    /// Write the state atomically (temp file + rename) so a crash never
    /// leaves a truncated blob behind.
    pub fn save(&self, sandbox_id: &str, state: &ControllerState) -> Result<()> {
        let path = self.state_path(sandbox_id);
        let dir = self.root.join(sandbox_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {dir}"))?;

        let tmp = dir.join(format!("{STATE_FILE}.tmp"));
        let contents = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp, contents)
            .with_context(|| format!("writing controller state {tmp}"))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("committing controller state {path}"))?;
        debug!(sandbox = sandbox_id, %path, "persisted controller state");
        Ok(())
    }

    /// Drop the persisted state. Deleting an absent state is a no-op.
    pub fn delete(&self, sandbox_id: &str) -> Result<()> {
        let path = self.state_path(sandbox_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing controller state {path}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{BridgeTable, BusType};

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = camino::Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, StateStore::new(root))
    }

    fn sample_state() -> ControllerState {
        let mut bridges = BridgeTable::create(BusType::Pci, 2);
        bridges.assign_addresses(2);
        bridges.allocate("drive-1", BusType::Pci).unwrap();
        ControllerState {
            uuid: "4a16c919-4bf6-4e4c-a1ee-bb4ca50db7e6".to_string(),
            bridges: bridges.bridges().to_vec(),
            hotplugged_vcpus: vec!["cpu-0".to_string(), "cpu-1".to_string()],
            hotplugged_memory_mib: 512,
            virtiofsd_pid: 4242,
            hotplug_vfio_on_root_bus: true,
            nvdimm_count: 1,
        }
    }

    #[test]
    fn test_round_trip_is_identical() {
        let (_dir, store) = store();
        let state = sample_state();
        store.save("sb", &state).unwrap();
        let loaded = store.load("sb").unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.load("absent").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites() {
        let (_dir, store) = store();
        let mut state = sample_state();
        store.save("sb", &state).unwrap();
        state.hotplugged_memory_mib += 256;
        store.save("sb", &state).unwrap();
        assert_eq!(
            store.load("sb").unwrap().unwrap().hotplugged_memory_mib,
            state.hotplugged_memory_mib
        );
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = store();
        store.save("sb", &sample_state()).unwrap();
        store.delete("sb").unwrap();
        assert!(store.load("sb").unwrap().is_none());
        store.delete("sb").unwrap();
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let (_dir, store) = store();
        let dir = store.root.join("sb");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(STATE_FILE),
            r#"{"uuid":"u","future_field":[1,2,3]}"#,
        )
        .unwrap();
        let state = store.load("sb").unwrap().unwrap();
        assert_eq!(state.uuid, "u");
        assert!(state.bridges.is_empty());
    }
}
