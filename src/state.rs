use crate::resource::{PropertyBag, ResourceId, fingerprint};
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Last-applied record for one resource: the raw desired property bag (with
/// reference tokens intact, so diffs and dependency inference stay
/// symmetric with declarations), the provider-assigned physical id, and the
/// provider outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub identity: ResourceId,
    pub properties: PropertyBag,
    pub property_hash: String,
    pub physical_id: String,
    #[serde(default)]
    pub outputs: PropertyBag,
    /// Old physical instances whose delete-half has not run yet. A replace
    /// commits the new instance with its predecessor deposed here; the ids
    /// survive a failed delete so a later apply can finish the cleanup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<String>,
}

impl ResourceRecord {
    pub fn new(
        identity: ResourceId,
        properties: PropertyBag,
        physical_id: String,
        outputs: PropertyBag,
    ) -> Self {
        let property_hash = fingerprint(&properties);
        Self {
            identity,
            properties,
            property_hash,
            physical_id,
            outputs,
            deposed: Vec::new(),
        }
    }
}

/// Apply-scoped lock persisted inside the snapshot. A stale lease is
/// detectable from `expires_at` but only an operator force-release clears
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lock {
    pub token: String,
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl Lock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now.timestamp()
    }
}

/// Opaque proof of lock ownership handed out by `begin_apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Durable record of the last successfully applied resource graph.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    pub resources: BTreeMap<ResourceId, ResourceRecord>,
    pub lock: Option<Lock>,
}

impl StateSnapshot {
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceRecord> {
        self.resources.get(id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.resources.contains_key(id)
    }

    pub fn identities(&self) -> impl Iterator<Item = &ResourceId> {
        self.resources.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }
}

/// On-disk shape of the snapshot.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    resources: Vec<ResourceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock: Option<Lock>,
}

impl From<&StateSnapshot> for SnapshotFile {
    fn from(snapshot: &StateSnapshot) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            resources: snapshot.resources.values().cloned().collect(),
            lock: snapshot.lock.clone(),
        }
    }
}

/// File-backed state store. Every mutation rewrites the file atomically
/// (temp file + rename), one resource at a time, so a crash mid-apply loses
/// at most the in-flight resource.
pub struct StateStore {
    path: PathBuf,
    lease: Duration,
    // Serializes load-modify-persist sequences across wave workers.
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, lease: Duration) -> Self {
        Self {
            path: path.into(),
            lease,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot; a missing file is an empty snapshot.
    pub fn load(&self) -> Result<StateSnapshot> {
        if !self.path.exists() {
            return Ok(StateSnapshot::default());
        }
        let text = fs::read_to_string(&self.path)?;
        let file: SnapshotFile = serde_json::from_str(&text)
            .map_err(|e| EngineError::State(format!("corrupt snapshot {}: {e}", self.path.display())))?;
        if file.version != SNAPSHOT_VERSION {
            return Err(EngineError::State(format!(
                "snapshot version {} is not supported (expected {})",
                file.version, SNAPSHOT_VERSION
            )));
        }

        let mut resources = BTreeMap::new();
        for record in file.resources {
            resources.insert(record.identity.clone(), record);
        }
        Ok(StateSnapshot {
            resources,
            lock: file.lock,
        })
    }

    /// Take the apply-scoped lock. Fails with `ConcurrentApply` whenever a
    /// lock is present, expired or not: stale locks are an operator call.
    pub fn begin_apply(&self) -> Result<LockToken> {
        let _guard = self.write_lock.lock().unwrap();
        let mut snapshot = self.load()?;

        if let Some(lock) = &snapshot.lock {
            let expired = lock.is_expired(Utc::now());
            tracing::warn!(
                holder = %lock.holder,
                expired,
                "apply lock already held"
            );
            return Err(EngineError::ConcurrentApply {
                holder: lock.holder.clone(),
                acquired_at: format_timestamp(lock.acquired_at),
                expires_at: format_timestamp(lock.expires_at),
            });
        }

        let now = Utc::now();
        let holder = lock_holder();
        let token = mint_token(&holder, now);
        snapshot.lock = Some(Lock {
            token: token.clone(),
            holder,
            acquired_at: now.timestamp(),
            expires_at: (now + self.lease).timestamp(),
        });
        self.persist(&snapshot)?;
        tracing::debug!(token, "acquired apply lock");
        Ok(LockToken(token))
    }

    /// Atomic per-resource commit, called after each successful provider
    /// call. Never batched.
    pub fn commit_resource(&self, token: &LockToken, record: ResourceRecord) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut snapshot = self.load()?;
        self.check_token(&snapshot, token)?;
        tracing::debug!(identity = %record.identity, physical_id = %record.physical_id, "committing resource");
        snapshot.resources.insert(record.identity.clone(), record);
        self.persist(&snapshot)
    }

    /// Atomic per-resource removal after a successful delete.
    pub fn remove_resource(&self, token: &LockToken, id: &ResourceId) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut snapshot = self.load()?;
        self.check_token(&snapshot, token)?;
        tracing::debug!(identity = %id, "removing resource from state");
        snapshot.resources.remove(id);
        self.persist(&snapshot)
    }

    pub fn end_apply(&self, token: LockToken) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut snapshot = self.load()?;
        self.check_token(&snapshot, &token)?;
        snapshot.lock = None;
        self.persist(&snapshot)?;
        tracing::debug!(token = token.as_str(), "released apply lock");
        Ok(())
    }

    /// Operator force-release of a stale lock. Returns the lock that was
    /// cleared, if any.
    pub fn force_unlock(&self) -> Result<Option<Lock>> {
        let _guard = self.write_lock.lock().unwrap();
        let mut snapshot = self.load()?;
        let cleared = snapshot.lock.take();
        if let Some(lock) = &cleared {
            tracing::warn!(holder = %lock.holder, token = %lock.token, "force-releasing apply lock");
            self.persist(&snapshot)?;
        }
        Ok(cleared)
    }

    fn check_token(&self, snapshot: &StateSnapshot, token: &LockToken) -> Result<()> {
        match &snapshot.lock {
            Some(lock) if lock.token == token.as_str() => Ok(()),
            Some(lock) => Err(EngineError::State(format!(
                "lock token mismatch: state is held by {}",
                lock.holder
            ))),
            None => Err(EngineError::State(
                "state is not locked; begin_apply was not called or the lock was force-released"
                    .to_string(),
            )),
        }
    }

    fn persist(&self, snapshot: &StateSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = SnapshotFile::from(snapshot);
        let text = serde_json::to_string_pretty(&file)
            .map_err(|e| EngineError::State(format!("serialize snapshot: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn lock_holder() -> String {
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown-host".to_string());
    format!("{}@{} (pid {})", whoami::username(), host, std::process::id())
}

fn mint_token(holder: &str, now: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(holder.as_bytes());
    hasher.update(now.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

pub fn format_timestamp(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| epoch_secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"), Duration::from_secs(60))
    }

    fn record(id: &str) -> ResourceRecord {
        let identity = ResourceId::parse(id).unwrap();
        let properties: PropertyBag =
            [("size".to_string(), json!("small"))].into_iter().collect();
        ResourceRecord::new(identity, properties, format!("phys-{id}"), PropertyBag::new())
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let snapshot = store(&dir).load().unwrap();
        assert!(snapshot.is_empty());
        assert!(snapshot.lock.is_none());
    }

    #[test]
    fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let token = store.begin_apply().unwrap();
        store.commit_resource(&token, record("database.main")).unwrap();
        store.commit_resource(&token, record("network.vpc")).unwrap();
        store.end_apply(token).unwrap();

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.lock.is_none());
        let db = snapshot.get(&ResourceId::new("database", "main")).unwrap();
        assert_eq!(db.physical_id, "phys-database.main");
        assert!(!db.property_hash.is_empty());
    }

    #[test]
    fn test_second_begin_apply_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let _token = store.begin_apply().unwrap();
        match store.begin_apply() {
            Err(EngineError::ConcurrentApply { holder, .. }) => {
                assert!(holder.contains(&std::process::id().to_string()));
            }
            other => panic!("expected ConcurrentApply, got {other:?}"),
        }
    }

    #[test]
    fn test_expired_lock_still_blocks_until_forced() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("state.json"), Duration::from_secs(0));

        let _token = store.begin_apply().unwrap();
        // Lease of zero seconds: already expired, still held.
        assert!(matches!(
            store.begin_apply(),
            Err(EngineError::ConcurrentApply { .. })
        ));

        let cleared = store.force_unlock().unwrap();
        assert!(cleared.is_some());
        assert!(store.begin_apply().is_ok());
    }

    #[test]
    fn test_commit_without_lock_fails() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let token = store.begin_apply().unwrap();
        store.end_apply(token.clone()).unwrap();
        assert!(store.commit_resource(&token, record("database.main")).is_err());
    }

    #[test]
    fn test_remove_resource() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let token = store.begin_apply().unwrap();
        store.commit_resource(&token, record("database.main")).unwrap();
        store
            .remove_resource(&token, &ResourceId::new("database", "main"))
            .unwrap();
        store.end_apply(token).unwrap();

        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_deposed_ids_survive_reload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut doomed = record("database.main");
        doomed.deposed = vec!["phys-database.main-old".to_string()];
        let token = store.begin_apply().unwrap();
        store.commit_resource(&token, doomed).unwrap();
        store.end_apply(token).unwrap();

        let snapshot = store.load().unwrap();
        let record = snapshot.get(&ResourceId::new("database", "main")).unwrap();
        assert_eq!(record.deposed, vec!["phys-database.main-old".to_string()]);
    }

    #[test]
    fn test_snapshot_without_deposed_field_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"version": 1, "resources": [{"identity": "database.main",
                "properties": {}, "property_hash": "x", "physical_id": "phys-1"}]}"#,
        )
        .unwrap();
        let store = StateStore::new(path, Duration::from_secs(60));
        let snapshot = store.load().unwrap();
        let record = snapshot.get(&ResourceId::new("database", "main")).unwrap();
        assert!(record.deposed.is_empty());
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version": 99, "resources": []}"#).unwrap();
        let store = StateStore::new(path, Duration::from_secs(60));
        assert!(matches!(store.load(), Err(EngineError::State(_))));
    }
}
