//! The saved-mesh store (§4.9): an ordered, file-backed map of meshes this
//! node has joined, persisted across restarts so `serve` can reconnect
//! without the user re-running `join`.
//!
//! Serialized as a JSON array (§6's `meshes.json`) with an atomic
//! write-to-temp-then-rename, since this file can be read by a
//! concurrently-running `serve` while a `join`/`forget` CLI invocation is
//! writing it.

use atmosphere_core::{ErrorKind, MeshId, SavedMesh};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("writing {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },

    #[error("decoding {path}: {source}")]
    Decode { path: PathBuf, source: serde_json::Error },

    #[error("encoding meshes.json: {0}")]
    Encode(serde_json::Error),

    #[error("no mesh with id {0}")]
    NotFound(MeshId),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Read { .. } | StoreError::Write { .. } => ErrorKind::Transient,
            StoreError::Decode { .. } | StoreError::Encode(_) => ErrorKind::BadRequest,
            StoreError::NotFound(_) => ErrorKind::BadRequest,
        }
    }
}

/// File-backed, in-memory-cached map of joined meshes. One mesh may be
/// marked active at a time; the router scopes itself to the active mesh's
/// peers and capabilities (§4.9).
pub struct MeshStore {
    path: PathBuf,
    meshes: BTreeMap<MeshId, SavedMesh>,
    active: Option<MeshId>,
}

impl MeshStore {
    /// Loads `path` if it exists, otherwise starts empty — a fresh
    /// `ATMOSPHERE_HOME` has no meshes yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (meshes, active) = if path.exists() {
            let raw = std::fs::read(&path).map_err(|source| StoreError::Read { path: path.clone(), source })?;
            let file: StoredFile =
                serde_json::from_slice(&raw).map_err(|source| StoreError::Decode { path: path.clone(), source })?;
            let meshes = file.meshes.into_iter().map(|m| (m.mesh_id, m)).collect();
            (meshes, file.active)
        } else {
            (BTreeMap::new(), None)
        };
        Ok(Self { path, meshes, active })
    }

    /// Insert or replace a mesh entry and persist.
    pub fn upsert(&mut self, mesh: SavedMesh) -> Result<()> {
        self.meshes.insert(mesh.mesh_id, mesh);
        self.flush()
    }

    /// Remove a mesh entirely. Clears the active marker if it pointed here.
    pub fn forget(&mut self, mesh_id: MeshId) -> Result<()> {
        if self.meshes.remove(&mesh_id).is_none() {
            return Err(StoreError::NotFound(mesh_id));
        }
        if self.active == Some(mesh_id) {
            self.active = None;
        }
        self.flush()
    }

    /// Mark one joined mesh as the active one. The caller is responsible for
    /// rescoping the router to it.
    pub fn activate(&mut self, mesh_id: MeshId) -> Result<()> {
        if !self.meshes.contains_key(&mesh_id) {
            return Err(StoreError::NotFound(mesh_id));
        }
        self.active = Some(mesh_id);
        self.flush()
    }

    pub fn active(&self) -> Option<&SavedMesh> {
        self.active.and_then(|id| self.meshes.get(&id))
    }

    pub fn get(&self, mesh_id: MeshId) -> Option<&SavedMesh> {
        self.meshes.get(&mesh_id)
    }

    pub fn all(&self) -> Vec<&SavedMesh> {
        self.meshes.values().collect()
    }

    /// Meshes flagged `auto_reconnect` that aren't the one already active,
    /// most-recently-connected first — the order `serve` should attempt
    /// reconnects in on startup.
    pub fn auto_reconnect_candidates(&self) -> Vec<&SavedMesh> {
        let mut candidates: Vec<&SavedMesh> = self
            .meshes
            .values()
            .filter(|m| m.auto_reconnect && Some(m.mesh_id) != self.active)
            .collect();
        candidates.sort_by(|a, b| b.last_connected.cmp(&a.last_connected));
        candidates
    }

    pub fn record_connected(&mut self, mesh_id: MeshId, now: u64) -> Result<()> {
        if let Some(mesh) = self.meshes.get_mut(&mesh_id) {
            mesh.last_connected = Some(now);
            self.flush()
        } else {
            Err(StoreError::NotFound(mesh_id))
        }
    }

    /// Atomic write: serialize to a sibling `.tmp` file, then rename over
    /// the target. A reader either sees the old file or the new one in
    /// full, never a partial write (§4.9's invariant).
    fn flush(&self) -> Result<()> {
        let file = StoredFile {
            active: self.active,
            meshes: self.meshes.values().cloned().collect(),
        };
        let encoded = serde_json::to_vec_pretty(&file).map_err(StoreError::Encode)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Write { path: self.path.clone(), source })?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &encoded).map_err(|source| StoreError::Write { path: tmp_path.clone(), source })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write { path: self.path.clone(), source })?;
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredFile {
    active: Option<MeshId>,
    meshes: Vec<SavedMesh>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::Endpoint;

    fn mesh(id: u8, auto_reconnect: bool, last_connected: Option<u64>) -> SavedMesh {
        SavedMesh {
            mesh_id: MeshId([id; 8]),
            mesh_name: format!("mesh-{id}"),
            mesh_public_key: [id; 32],
            founder_node_id: atmosphere_core::NodeId([id; 16]),
            relay_token: None,
            endpoints: vec![Endpoint::Lan { host: "10.0.0.1".into(), port: 7420 }],
            joined_at: 0,
            last_connected,
            auto_reconnect,
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshes.json");

        let mut store = MeshStore::open(&path).unwrap();
        store.upsert(mesh(1, true, Some(10))).unwrap();
        store.activate(MeshId([1; 8])).unwrap();
        drop(store);

        let reloaded = MeshStore::open(&path).unwrap();
        assert_eq!(reloaded.all().len(), 1);
        assert_eq!(reloaded.active().unwrap().mesh_id, MeshId([1; 8]));
    }

    #[test]
    fn forget_clears_active_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MeshStore::open(dir.path().join("meshes.json")).unwrap();
        store.upsert(mesh(1, false, None)).unwrap();
        store.activate(MeshId([1; 8])).unwrap();
        store.forget(MeshId([1; 8])).unwrap();
        assert!(store.active().is_none());
        assert!(store.all().is_empty());
    }

    #[test]
    fn auto_reconnect_candidates_sorted_by_recency_excluding_active() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = MeshStore::open(dir.path().join("meshes.json")).unwrap();
        store.upsert(mesh(1, true, Some(5))).unwrap();
        store.upsert(mesh(2, true, Some(20))).unwrap();
        store.upsert(mesh(3, false, Some(30))).unwrap();
        store.activate(MeshId([2; 8])).unwrap();

        let candidates = store.auto_reconnect_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].mesh_id, MeshId([1; 8]));
    }
}
