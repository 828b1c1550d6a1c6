//! In-memory artifact store.
//!
//! HashMap-backed store implementing `ArtifactStore`. Records every call and
//! can be told to fail uploads or deletes, which is what the orchestration
//! tests use to exercise retry and best-effort paths.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{resolve_upload_entries, ArtifactRef, ArtifactStore, UploadOptions};
use crate::error::StoreError;

/// One store operation, as observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Find(String),
    Download(String),
    Delete(String),
    Upload { name: String, files: Vec<PathBuf> },
}

impl StoreCall {
    pub fn name(&self) -> &str {
        match self {
            StoreCall::Find(name) | StoreCall::Download(name) | StoreCall::Delete(name) => name,
            StoreCall::Upload { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredArtifact {
    artifact: ArtifactRef,
    contents: BTreeMap<PathBuf, Vec<u8>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    artifacts: HashMap<String, StoredArtifact>,
    calls: Vec<StoreCall>,
    next_id: u64,
    failing_uploads: u32,
    fail_all_uploads: bool,
    fail_deletes: bool,
    atomic_overwrite: bool,
}

/// Thread-safe in-memory artifact store.
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose uploads replace existing artifacts in place.
    pub fn with_atomic_overwrite() -> Self {
        let store = Self::new();
        store.state().atomic_overwrite = true;
        store
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail the next `count` uploads with `StoreError::Unavailable`.
    pub fn fail_next_uploads(&self, count: u32) {
        self.state().failing_uploads = count;
    }

    /// Fail every upload from now on.
    pub fn fail_all_uploads(&self, fail: bool) {
        self.state().fail_all_uploads = fail;
    }

    /// Fail every delete with `StoreError::Unavailable`.
    pub fn fail_deletes(&self, fail: bool) {
        self.state().fail_deletes = fail;
    }

    /// Pre-populate an artifact (used by tests).
    pub fn insert(&self, name: &str, contents: BTreeMap<PathBuf, Vec<u8>>) -> ArtifactRef {
        let mut state = self.state();
        let artifact = new_ref(&mut state, name, &contents, UploadOptions::default());
        state.artifacts.insert(
            name.to_string(),
            StoredArtifact {
                artifact: artifact.clone(),
                contents,
            },
        );
        artifact
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().artifacts.contains_key(name)
    }

    /// Number of stored artifacts
    pub fn len(&self) -> usize {
        self.state().artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().artifacts.keys().cloned().collect();
        names.sort();
        names
    }

    /// Contents of a stored artifact, keyed by relative path
    pub fn contents(&self, name: &str) -> Option<BTreeMap<PathBuf, Vec<u8>>> {
        self.state().artifacts.get(name).map(|a| a.contents.clone())
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state().calls.clone()
    }

    pub fn upload_calls(&self, name: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c, StoreCall::Upload { name: n, .. } if n == name))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }
}

fn new_ref(
    state: &mut MemoryState,
    name: &str,
    contents: &BTreeMap<PathBuf, Vec<u8>>,
    options: UploadOptions,
) -> ArtifactRef {
    state.next_id += 1;
    let created_at = Utc::now();
    ArtifactRef {
        id: state.next_id,
        name: name.to_string(),
        size: contents.values().map(|c| c.len() as u64).sum(),
        files: contents.keys().cloned().collect(),
        created_at,
        expires_at: options.expiry_from(created_at),
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn find(&self, name: &str) -> BoxFuture<'_, Result<ArtifactRef, StoreError>> {
        let name = name.to_string();
        async move {
            let mut state = self.state();
            state.calls.push(StoreCall::Find(name.clone()));
            state
                .artifacts
                .get(&name)
                .filter(|a| !a.artifact.is_expired(Utc::now()))
                .map(|a| a.artifact.clone())
                .ok_or(StoreError::NotFound(name))
        }
        .boxed()
    }

    fn download(
        &self,
        artifact: ArtifactRef,
        dest_dir: PathBuf,
    ) -> BoxFuture<'_, Result<Vec<PathBuf>, StoreError>> {
        async move {
            let contents = {
                let mut state = self.state();
                state.calls.push(StoreCall::Download(artifact.name.clone()));
                match state.artifacts.get(&artifact.name) {
                    Some(stored) if stored.artifact.id == artifact.id => stored.contents.clone(),
                    _ => return Err(StoreError::NotFound(artifact.name.clone())),
                }
            };

            let mut written = Vec::with_capacity(contents.len());
            for (relative, bytes) in contents {
                let target = dest_dir.join(&relative);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, bytes).await?;
                written.push(target);
            }
            Ok(written)
        }
        .boxed()
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, Result<(), StoreError>> {
        let name = name.to_string();
        async move {
            let mut state = self.state();
            state.calls.push(StoreCall::Delete(name.clone()));
            if state.fail_deletes {
                return Err(StoreError::Unavailable(format!("delete of {} rejected", name)));
            }
            state
                .artifacts
                .remove(&name)
                .map(|_| ())
                .ok_or(StoreError::NotFound(name))
        }
        .boxed()
    }

    fn upload(
        &self,
        name: &str,
        files: Vec<PathBuf>,
        base_dir: PathBuf,
        options: UploadOptions,
    ) -> BoxFuture<'_, Result<ArtifactRef, StoreError>> {
        let name = name.to_string();
        async move {
            let entries = resolve_upload_entries(&files, &base_dir)?;
            {
                let mut state = self.state();
                state.calls.push(StoreCall::Upload {
                    name: name.clone(),
                    files: entries.iter().map(|(rel, _)| rel.clone()).collect(),
                });
                if state.fail_all_uploads {
                    return Err(StoreError::Unavailable(format!("upload of {} rejected", name)));
                }
                if state.failing_uploads > 0 {
                    state.failing_uploads -= 1;
                    return Err(StoreError::Unavailable(format!(
                        "upload of {} rejected ({} more to fail)",
                        name, state.failing_uploads
                    )));
                }
                if !state.atomic_overwrite && state.artifacts.contains_key(&name) {
                    return Err(StoreError::Conflict(name));
                }
            }

            let mut contents = BTreeMap::new();
            for (relative, absolute) in entries {
                contents.insert(relative, tokio::fs::read(&absolute).await?);
            }

            let mut state = self.state();
            let artifact = new_ref(&mut state, &name, &contents, options);
            state.artifacts.insert(
                name,
                StoredArtifact {
                    artifact: artifact.clone(),
                    contents,
                },
            );
            Ok(artifact)
        }
        .boxed()
    }

    fn supports_atomic_overwrite(&self) -> bool {
        self.state().atomic_overwrite
    }
}
