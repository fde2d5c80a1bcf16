//! Checkpoint persistence - one snapshot per mission thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use super::mission::MissionState;

/// Stores full mission snapshots keyed by mission id.
pub trait CheckpointStore: Send + Sync {
    /// Persist the snapshot, replacing any previous one for the mission
    fn save(&self, state: &MissionState) -> Result<()>;

    /// Load the latest snapshot for a mission
    fn load(&self, mission_id: &str) -> Result<Option<MissionState>>;

    /// All mission ids with a stored snapshot, sorted
    fn list(&self) -> Result<Vec<String>>;
}

/// JSON files under `.convoy/checkpoints/`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, mission_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", mission_id))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, state: &MissionState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = self.path_for(&state.mission_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        // Write then rename so a crash never leaves a torn snapshot
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to commit checkpoint {}", path.display()))?;

        tracing::debug!(
            mission_id = %state.mission_id,
            status = %state.status,
            wave = state.wave,
            "Checkpoint saved"
        );
        Ok(())
    }

    fn load(&self, mission_id: &str) -> Result<Option<MissionState>> {
        let path = self.path_for(mission_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse checkpoint {}", path.display()))?;
        Ok(Some(state))
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json").map(|s| s.to_string())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// In-process store, used by tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    snapshots: Mutex<HashMap<String, MissionState>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, state: &MissionState) -> Result<()> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        snapshots.insert(state.mission_id.clone(), state.clone());
        Ok(())
    }

    fn load(&self, mission_id: &str) -> Result<Option<MissionState>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        Ok(snapshots.get(mission_id).cloned())
    }

    fn list(&self) -> Result<Vec<String>> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("checkpoint store lock poisoned"))?;
        let mut ids: Vec<String> = snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
