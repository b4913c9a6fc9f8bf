// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Artifact Cache
//!
//! Content-addressed store of build artifacts, keyed by node fingerprint.
//!
//! **Layout:**
//! - `<root>/artifacts/<fingerprint>.tar` committed artifacts
//! - `<root>/tmp/` staging files of writers still producing
//!
//! **Writers:** [`ArtifactCache::put`] hands out at most one
//! [`ArtifactWriter`] per fingerprint at a time. A second `put` for the same
//! fingerprint waits until the first writer commits or is dropped, then sees
//! the committed artifact (or becomes the writer itself if the first one
//! gave up). Writers for different fingerprints never wait on each other,
//! and readers never wait at all: [`ArtifactCache::get`] reports an artifact
//! whose slot is held as not present. A slot is forgotten once nobody holds
//! or waits for it.
//!
//! **Tiers:** an optional remote [`ArtifactSource`] is tried on a local miss;
//! a remote hit is copied into the local store before it is returned.

pub mod remote;

pub use remote::HttpArtifactSource;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::cache::{ArtifactHandle, ArtifactSource, CacheError};
use crate::domain::graph::Fingerprint;

/// Result of [`ArtifactCache::put`]
pub enum PutOutcome {
    /// The artifact exists; nothing to produce
    Present(ArtifactHandle),
    /// The caller holds the writer slot and must produce the artifact
    Write(ArtifactWriter),
}

type WriterSlots = Arc<DashMap<Fingerprint, Arc<Mutex<()>>>>;

pub struct ArtifactCache {
    root: PathBuf,
    writer_slots: WriterSlots,
    remote: Option<Arc<dyn ArtifactSource>>,
}

impl ArtifactCache {
    /// Opens (creating if needed) a cache rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        for dir in [root.join("artifacts"), root.join("tmp")] {
            std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        }
        Ok(Self {
            root,
            writer_slots: Arc::new(DashMap::new()),
            remote: None,
        })
    }

    pub fn with_remote(mut self, remote: Arc<dyn ArtifactSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join("artifacts")
            .join(format!("{}.tar", fingerprint.as_str()))
    }

    fn handle(&self, fingerprint: &Fingerprint) -> ArtifactHandle {
        let path = self.artifact_path(fingerprint);
        ArtifactHandle {
            fingerprint: fingerprint.clone(),
            location: format!("file://{}", path.display()),
            path,
        }
    }

    fn local(&self, fingerprint: &Fingerprint) -> Option<ArtifactHandle> {
        self.artifact_path(fingerprint)
            .is_file()
            .then(|| self.handle(fingerprint))
    }

    /// Whether the local store holds the artifact
    pub fn has_local(&self, fingerprint: &Fingerprint) -> bool {
        self.artifact_path(fingerprint).is_file()
    }

    /// Whether any tier holds the artifact
    pub async fn has(&self, fingerprint: &Fingerprint) -> bool {
        if self.has_local(fingerprint) {
            return true;
        }
        match &self.remote {
            Some(remote) => remote.has(fingerprint).await.unwrap_or_else(|e| {
                warn!(fingerprint = %fingerprint, error = %e, "Remote artifact cache lookup failed");
                false
            }),
            None => false,
        }
    }

    /// Handle of a committed artifact, pulling it from the remote tier on a
    /// local miss
    ///
    /// Never waits for a writer: an artifact being produced right now is not
    /// present yet.
    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<ArtifactHandle, CacheError> {
        if let Some(handle) = self.local(fingerprint) {
            return Ok(handle);
        }
        if self.remote.is_none() {
            return Err(CacheError::NotPresent(fingerprint.clone()));
        }
        let Ok(guard) = self.slot(fingerprint).try_lock_owned() else {
            debug!(fingerprint = %fingerprint, "Artifact is being written, not waiting for it");
            return Err(CacheError::NotPresent(fingerprint.clone()));
        };
        match self.claimed(fingerprint, self.slot_guard(fingerprint, guard)).await? {
            PutOutcome::Present(handle) => Ok(handle),
            PutOutcome::Write(_) => Err(CacheError::NotPresent(fingerprint.clone())),
        }
    }

    /// Claims the writer slot for `fingerprint`, waiting while another
    /// writer holds it
    pub async fn put(&self, fingerprint: &Fingerprint) -> Result<PutOutcome, CacheError> {
        let guard = self.slot(fingerprint).lock_owned().await;
        self.claimed(fingerprint, self.slot_guard(fingerprint, guard)).await
    }

    fn slot(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        self.writer_slots
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn slot_guard(&self, fingerprint: &Fingerprint, guard: OwnedMutexGuard<()>) -> SlotGuard {
        SlotGuard {
            fingerprint: fingerprint.clone(),
            slots: self.writer_slots.clone(),
            guard: Some(guard),
        }
    }

    async fn claimed(&self, fingerprint: &Fingerprint, slot: SlotGuard) -> Result<PutOutcome, CacheError> {
        if let Some(handle) = self.local(fingerprint) {
            debug!(fingerprint = %fingerprint, "Artifact present after acquiring writer slot");
            return Ok(PutOutcome::Present(handle));
        }

        let writer = ArtifactWriter {
            fingerprint: fingerprint.clone(),
            staging: self
                .root
                .join("tmp")
                .join(format!("{}.{}.partial", fingerprint.as_str(), Uuid::new_v4())),
            destination: self.artifact_path(fingerprint),
            location: self.handle(fingerprint).location,
            committed: false,
            _slot: slot,
        };

        if let Some(remote) = &self.remote {
            match remote.fetch(fingerprint, writer.path()).await {
                Ok(true) => {
                    debug!(fingerprint = %fingerprint, source = remote.name(), "Pulled artifact from remote tier");
                    return writer.commit().map(PutOutcome::Present);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(fingerprint = %fingerprint, error = %e, "Remote artifact fetch failed");
                }
            }
        }

        Ok(PutOutcome::Write(writer))
    }

    /// Returns the artifact, running `produce` to create it if no tier has it
    ///
    /// `produce` receives the staging path it must write to. Concurrent
    /// callers for the same fingerprint run `produce` at most once between
    /// them unless it fails.
    pub async fn get_or_produce<F, Fut, E>(
        &self,
        fingerprint: &Fingerprint,
        produce: F,
    ) -> Result<ArtifactHandle, CacheError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        match self.put(fingerprint).await? {
            PutOutcome::Present(handle) => Ok(handle),
            PutOutcome::Write(writer) => {
                produce(writer.path().to_path_buf())
                    .await
                    .map_err(|e| CacheError::ProductionFailed {
                        fingerprint: fingerprint.clone(),
                        reason: e.to_string(),
                    })?;
                writer.commit()
            }
        }
    }
}

/// A held writer slot; releasing the last reference removes it from the map
struct SlotGuard {
    fingerprint: Fingerprint,
    slots: WriterSlots,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        // The guard owns a reference to the slot; release it first
        self.guard.take();
        self.slots
            .remove_if(&self.fingerprint, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Exclusive right to produce one artifact
///
/// Dropping the writer without committing discards the staging file and
/// releases the slot.
pub struct ArtifactWriter {
    fingerprint: Fingerprint,
    staging: PathBuf,
    destination: PathBuf,
    location: String,
    committed: bool,
    _slot: SlotGuard,
}

impl ArtifactWriter {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Where the artifact must be written before commit
    pub fn path(&self) -> &Path {
        &self.staging
    }

    /// Moves the staged artifact into the store
    pub fn commit(mut self) -> Result<ArtifactHandle, CacheError> {
        if !self.staging.is_file() {
            return Err(CacheError::NothingWritten(self.fingerprint.clone()));
        }
        std::fs::rename(&self.staging, &self.destination)
            .map_err(|e| CacheError::io(&self.destination, e))?;
        self.committed = true;
        debug!(fingerprint = %self.fingerprint, "Committed artifact");
        Ok(ArtifactHandle {
            fingerprint: self.fingerprint.clone(),
            path: self.destination.clone(),
            location: self.location.clone(),
        })
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            if let Err(e) = std::fs::remove_file(&self.staging) {
                warn!(fingerprint = %self.fingerprint, error = %e, "Failed to remove staging file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::graph::NodeKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fp(name: &str) -> Fingerprint {
        Fingerprint::compute(NodeKind::Chunk, name, "", &[])
    }

    #[tokio::test]
    async fn test_get_missing_is_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let err = cache.get(&fp("a")).await.unwrap_err();
        assert!(matches!(err, CacheError::NotPresent(_)));
        assert!(!cache.has(&fp("a")).await);
    }

    #[tokio::test]
    async fn test_commit_makes_artifact_visible() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let PutOutcome::Write(writer) = cache.put(&fp("a")).await.unwrap() else {
            panic!("expected writer");
        };
        std::fs::write(writer.path(), b"tarball").unwrap();
        let handle = writer.commit().unwrap();

        assert!(cache.has_local(&fp("a")));
        assert_eq!(cache.get(&fp("a")).await.unwrap(), handle);
        assert!(handle.location.starts_with("file://"));
        assert!(matches!(cache.put(&fp("a")).await.unwrap(), PutOutcome::Present(_)));
    }

    #[tokio::test]
    async fn test_commit_without_content_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let PutOutcome::Write(writer) = cache.put(&fp("a")).await.unwrap() else {
            panic!("expected writer");
        };
        assert!(matches!(writer.commit(), Err(CacheError::NothingWritten(_))));
        assert!(matches!(cache.put(&fp("a")).await.unwrap(), PutOutcome::Write(_)));
    }

    #[tokio::test]
    async fn test_dropped_writer_releases_slot_and_staging() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let staging = {
            let PutOutcome::Write(writer) = cache.put(&fp("a")).await.unwrap() else {
                panic!("expected writer");
            };
            std::fs::write(writer.path(), b"half").unwrap();
            writer.path().to_path_buf()
        };
        assert!(!staging.exists());
        assert!(matches!(cache.put(&fp("a")).await.unwrap(), PutOutcome::Write(_)));
    }

    #[tokio::test]
    async fn test_concurrent_producers_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtifactCache::open(dir.path()).unwrap());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_produce(&fp("shared"), |path| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        std::fs::write(path, b"built")
                    })
                    .await
            }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_other_fingerprints_do_not_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::open(dir.path()).unwrap();
        let _held = cache.put(&fp("a")).await.unwrap();
        let other = tokio::time::timeout(Duration::from_secs(1), cache.put(&fp("b"))).await;
        assert!(matches!(other, Ok(Ok(PutOutcome::Write(_)))));
    }

    #[tokio::test]
    async fn test_released_slots_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ArtifactCache::open(dir.path()).unwrap());

        for name in ["a", "b", "c"] {
            let PutOutcome::Write(writer) = cache.put(&fp(name)).await.unwrap() else {
                panic!("expected writer");
            };
            std::fs::write(writer.path(), name).unwrap();
            writer.commit().unwrap();
        }
        assert!(matches!(cache.put(&fp("a")).await.unwrap(), PutOutcome::Present(_)));
        drop(cache.put(&fp("d")).await.unwrap());
        assert_eq!(cache.writer_slots.len(), 0);

        // A waiter keeps the slot alive after the writer goes away
        let PutOutcome::Write(writer) = cache.put(&fp("e")).await.unwrap() else {
            panic!("expected writer");
        };
        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.put(&fp("e")).await.map(|outcome| matches!(outcome, PutOutcome::Write(_))) })
        };
        while Arc::strong_count(cache.writer_slots.get(&fp("e")).unwrap().value()) < 3 {
            tokio::task::yield_now().await;
        }
        drop(writer);
        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(cache.writer_slots.len(), 0);
    }

    struct FixedSource {
        artifacts: HashMap<Fingerprint, Vec<u8>>,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl ArtifactSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn has(&self, fingerprint: &Fingerprint) -> Result<bool, CacheError> {
            Ok(self.artifacts.contains_key(fingerprint))
        }

        async fn fetch(&self, fingerprint: &Fingerprint, dest: &Path) -> Result<bool, CacheError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.artifacts.get(fingerprint) {
                Some(bytes) => {
                    std::fs::write(dest, bytes).map_err(|e| CacheError::io(dest, e))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_hit_is_copied_locally() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FixedSource {
            artifacts: HashMap::from([(fp("a"), b"remote".to_vec())]),
            fetches: AtomicUsize::new(0),
        });
        let cache = ArtifactCache::open(dir.path()).unwrap().with_remote(remote.clone());

        assert!(cache.has(&fp("a")).await);
        let handle = cache.get(&fp("a")).await.unwrap();
        assert_eq!(std::fs::read(&handle.path).unwrap(), b"remote");
        assert!(cache.has_local(&fp("a")));

        cache.get(&fp("a")).await.unwrap();
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);

        assert!(matches!(cache.get(&fp("b")).await, Err(CacheError::NotPresent(_))));
    }

    #[tokio::test]
    async fn test_get_does_not_wait_for_a_writer() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(FixedSource {
            artifacts: HashMap::from([(fp("a"), b"remote".to_vec())]),
            fetches: AtomicUsize::new(0),
        });
        let cache = ArtifactCache::open(dir.path()).unwrap().with_remote(remote.clone());

        let held = cache.put(&fp("b")).await.unwrap();
        let lookup = tokio::time::timeout(Duration::from_secs(1), cache.get(&fp("b"))).await;
        assert!(matches!(lookup, Ok(Err(CacheError::NotPresent(_)))));
        drop(held);

        // Once the slot is free the remote tier is consulted again
        assert!(cache.get(&fp("a")).await.is_ok());
        assert_eq!(remote.fetches.load(Ordering::SeqCst), 2);
    }
}
