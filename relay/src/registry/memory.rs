use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use super::{Payload, Registry};
use crate::error::RegistryError;
use crate::ident::ArtifactId;

/// An in-process registry.
///
/// Mostly useful to exercise the relay protocols without a network: it can simulate transient push failures,
/// eventual consistency (artifacts staying invisible for a number of reads after being pushed) and slow fetches.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    artifacts: HashMap<ArtifactId, Payload>,
    /// Successfully pushed artifacts, in order.
    pushed: Vec<ArtifactId>,
    push_attempts: usize,
    /// Failures returned by the next push attempts, in order.
    push_failures: VecDeque<RegistryError>,
    /// Number of reads an artifact stays invisible after being pushed.
    visibility_lag: usize,
    /// Remaining invisible reads per artifact.
    lagging: HashMap<ArtifactId, usize>,
    fetch_delays: HashMap<ArtifactId, Duration>,
    fetches: HashMap<ArtifactId, usize>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep every pushed artifact invisible for its first `reads` reads.
    pub fn with_visibility_lag(self, reads: usize) -> Self {
        self.lock().visibility_lag = reads;
        self
    }

    /// Make the next push attempt fail with `error`.
    pub fn fail_next_push(&self, error: RegistryError) {
        self.lock().push_failures.push_back(error);
    }

    /// Delay every fetch of artifact `id` by `delay`.
    pub fn set_fetch_delay(&self, id: ArtifactId, delay: Duration) {
        self.lock().fetch_delays.insert(id, delay);
    }

    /// Store an artifact directly, bypassing push bookkeeping.
    pub fn insert(&self, id: ArtifactId, payload: Payload) {
        self.lock().artifacts.insert(id, payload);
    }

    /// Drop an artifact, as if it had never been published.
    pub fn remove(&self, id: &ArtifactId) -> Option<Payload> {
        self.lock().artifacts.remove(id)
    }

    pub fn contains(&self, id: &ArtifactId) -> bool {
        self.lock().artifacts.contains_key(id)
    }

    /// Return the payload of `id` regardless of its visibility.
    pub fn get(&self, id: &ArtifactId) -> Option<Payload> {
        self.lock().artifacts.get(id).cloned()
    }

    /// Successfully pushed artifacts, in push order.
    pub fn pushed(&self) -> Vec<ArtifactId> {
        self.lock().pushed.clone()
    }

    pub fn push_attempts(&self) -> usize {
        self.lock().push_attempts
    }

    /// Number of fetches of `id`, visible or not.
    pub fn fetch_count(&self, id: &ArtifactId) -> usize {
        self.lock().fetches.get(id).copied().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // state is never left inconsistent by a panicking holder
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self, id: &ArtifactId) -> Result<Payload, RegistryError> {
        let mut state = self.lock();

        *state.fetches.entry(id.clone()).or_default() += 1;

        if let Some(remaining) = state.lagging.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RegistryError::NotFound(id.clone()));
            }
        }

        state.artifacts.get(id).cloned().ok_or_else(|| RegistryError::NotFound(id.clone()))
    }
}

impl Registry for MemoryRegistry {
    async fn push(&self, id: &ArtifactId, files: &[PathBuf]) -> Result<(), RegistryError> {
        let failure = {
            let mut state = self.lock();
            state.push_attempts += 1;
            state.push_failures.pop_front()
        };

        if let Some(err) = failure {
            tracing::trace!("Rejecting push of {id}: {err}");
            return Err(err);
        }

        let payload = Payload::read(files).await?;

        let mut state = self.lock();

        if state.artifacts.contains_key(id) {
            return Err(RegistryError::Fatal(format!("{id} has already been published")));
        }

        let lag = state.visibility_lag;
        if lag > 0 {
            state.lagging.insert(id.clone(), lag);
        }

        state.artifacts.insert(id.clone(), payload);
        state.pushed.push(id.clone());

        Ok(())
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Payload, RegistryError> {
        let delay = self.lock().fetch_delays.get(id).copied();

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.read(id)
    }

    async fn fetch_field(&self, id: &ArtifactId, pointer: &str) -> Result<serde_json::Value, RegistryError> {
        self.read(id)?.descriptor_field(id, pointer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::DESCRIPTOR_FILE;

    fn id(version: &str) -> ArtifactId {
        ArtifactId::new("relay-core-part", version)
    }

    async fn stage(dir: &std::path::Path, version: &str) -> Vec<PathBuf> {
        let descriptor = dir.join(DESCRIPTOR_FILE);
        let body = serde_json::json!({ "name": "relay-core-part", "version": version, "files": ["chunk.bin"] });
        tokio::fs::write(&descriptor, body.to_string()).await.unwrap();

        let chunk = dir.join("chunk.bin");
        tokio::fs::write(&chunk, b"ABC").await.unwrap();

        vec![descriptor, chunk]
    }

    #[tokio::test]
    async fn test_push_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MemoryRegistry::new();
        let files = stage(dir.path(), "1").await;

        assert!(registry.fetch(&id("1")).await.unwrap_err().is_not_found());

        registry.push(&id("1"), &files).await.unwrap();

        let payload = registry.fetch(&id("1")).await.unwrap();
        assert_eq!(&payload.get("chunk.bin").unwrap()[..], b"ABC");
        assert_eq!(registry.fetch_field(&id("1"), "/version").await.unwrap(), "1");
        assert!(registry.fetch_field(&id("1"), "/missing").await.unwrap_err().is_not_found());
        assert_eq!(registry.pushed(), [id("1")]);
    }

    #[tokio::test]
    async fn test_push_rejects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MemoryRegistry::new();
        let files = stage(dir.path(), "1").await;

        registry.push(&id("1"), &files).await.unwrap();
        assert!(matches!(registry.push(&id("1"), &files).await, Err(RegistryError::Fatal(_))));
        assert_eq!(registry.push_attempts(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MemoryRegistry::new();
        let files = stage(dir.path(), "1").await;

        registry.fail_next_push(RegistryError::Transient("connection reset".into()));

        assert!(registry.push(&id("1"), &files).await.unwrap_err().is_transient());
        assert!(!registry.contains(&id("1")));
        registry.push(&id("1"), &files).await.unwrap();
        assert!(registry.contains(&id("1")));
    }

    #[tokio::test]
    async fn test_visibility_lag() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MemoryRegistry::new().with_visibility_lag(2);
        let files = stage(dir.path(), "1").await;

        registry.push(&id("1"), &files).await.unwrap();

        assert!(registry.fetch(&id("1")).await.unwrap_err().is_not_found());
        assert!(registry.fetch_field(&id("1"), "/version").await.unwrap_err().is_not_found());
        assert!(registry.fetch(&id("1")).await.is_ok());
        assert_eq!(registry.fetch_count(&id("1")), 3);
    }
}
