//! Persistence boundary for application, secret and namespace records.
//!
//! The control plane never owns the database; callers inject an [`AppStore`].
//! [`MemoryStore`] backs the binaries (optionally seeded from a JSON snapshot)
//! and every test.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::{BTreeMap, HashSet}, path::Path, sync::Mutex};
use crate::models::{AppState, Application, SecretRecord};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("store backend: {0}")]
    Backend(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role { Admin, User }

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn load(&self, appid: &str) -> Result<Application, StoreError>;
    /// Application scoped to a namespace; `None` when either is unknown.
    async fn find(&self, nsid: &str, appid: &str) -> Result<Option<Application>, StoreError>;
    async fn set_state(&self, appid: &str, state: AppState) -> Result<(), StoreError>;
    async fn set_connection_port(&self, appid: &str, port: u16) -> Result<(), StoreError>;
    /// Drops volume records and clears them from the pending-deletion list.
    async fn remove_volumes(&self, appid: &str, volids: &[String]) -> Result<(), StoreError>;
    /// Removes the application and every child record it owns. Secrets stay.
    async fn delete_app(&self, appid: &str) -> Result<(), StoreError>;
    async fn secret(&self, secretid: &str) -> Result<Option<SecretRecord>, StoreError>;
    async fn namespace_role(&self, nsid: &str, subject: &str) -> Result<Option<Role>, StoreError>;
    /// Connection ports currently held by any application.
    async fn allocated_ports(&self) -> Result<HashSet<u16>, StoreError>;
}

/// On-disk seed format for [`MemoryStore::from_snapshot`].
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub apps: Vec<Application>,
    #[serde(default)]
    pub secrets: Vec<SecretRecord>,
    /// namespace -> subject -> role
    #[serde(default)]
    pub roles: BTreeMap<String, BTreeMap<String, Role>>,
}

#[derive(Default)]
struct Inner {
    apps: BTreeMap<String, Application>,
    secrets: BTreeMap<String, SecretRecord>,
    roles: BTreeMap<String, BTreeMap<String, Role>>,
}

#[derive(Default)]
pub struct MemoryStore { inner: Mutex<Inner> }

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn from_snapshot_file(path: &Path) -> Result<Self, StoreError> {
        let raw = std::fs::read_to_string(path).map_err(|e| StoreError::Backend(format!("read {}: {e}", path.display())))?;
        let snap: StoreSnapshot = serde_json::from_str(&raw).map_err(|e| StoreError::Backend(format!("parse {}: {e}", path.display())))?;
        Ok(Self::from_snapshot(snap))
    }

    pub fn from_snapshot(snap: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut g = store.lock();
            g.apps = snap.apps.into_iter().map(|a| (a.appid.clone(), a)).collect();
            g.secrets = snap.secrets.into_iter().map(|s| (s.secretid.clone(), s)).collect();
            g.roles = snap.roles;
        }
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let g = self.lock();
        StoreSnapshot { apps: g.apps.values().cloned().collect(), secrets: g.secrets.values().cloned().collect(), roles: g.roles.clone() }
    }

    /// Written to a sibling temp file first, then renamed over `path`.
    pub fn write_snapshot_file(&self, path: &Path) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(&self.snapshot()).map_err(|e| StoreError::Backend(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| StoreError::Backend(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, path).map_err(|e| StoreError::Backend(format!("rename {}: {e}", path.display())))
    }

    pub fn insert_app(&self, app: Application) { self.lock().apps.insert(app.appid.clone(), app); }
    pub fn insert_secret(&self, secret: SecretRecord) { self.lock().secrets.insert(secret.secretid.clone(), secret); }

    pub fn grant(&self, nsid: &str, subject: &str, role: Role) {
        self.lock().roles.entry(nsid.to_string()).or_default().insert(subject.to_string(), role);
    }

    /// Snapshot of a record without going through the async trait.
    pub fn get(&self, appid: &str) -> Option<Application> { self.lock().apps.get(appid).cloned() }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update; the maps stay usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn with_app<T>(&self, appid: &str, f: impl FnOnce(&mut Application) -> T) -> Result<T, StoreError> {
        let mut g = self.lock();
        let app = g.apps.get_mut(appid).ok_or_else(|| StoreError::NotFound(format!("app {appid} not found")))?;
        Ok(f(app))
    }
}

#[async_trait]
impl AppStore for MemoryStore {
    async fn load(&self, appid: &str) -> Result<Application, StoreError> {
        self.get(appid).ok_or_else(|| StoreError::NotFound(format!("app {appid} not found")))
    }

    async fn find(&self, nsid: &str, appid: &str) -> Result<Option<Application>, StoreError> {
        Ok(self.get(appid).filter(|a| a.namespace == nsid))
    }

    async fn set_state(&self, appid: &str, state: AppState) -> Result<(), StoreError> {
        self.with_app(appid, |a| a.state = state)
    }

    async fn set_connection_port(&self, appid: &str, port: u16) -> Result<(), StoreError> {
        self.with_app(appid, |a| a.connection.port = Some(port))
    }

    async fn remove_volumes(&self, appid: &str, volids: &[String]) -> Result<(), StoreError> {
        self.with_app(appid, |a| {
            a.volumes.retain(|v| !volids.contains(&v.volid));
            a.volumes_to_delete.retain(|id| !volids.contains(id));
        })
    }

    async fn delete_app(&self, appid: &str) -> Result<(), StoreError> {
        self.lock().apps.remove(appid).map(|_| ()).ok_or_else(|| StoreError::NotFound(format!("app {appid} not found")))
    }

    async fn secret(&self, secretid: &str) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.lock().secrets.get(secretid).cloned())
    }

    async fn namespace_role(&self, nsid: &str, subject: &str) -> Result<Option<Role>, StoreError> {
        Ok(self.lock().roles.get(nsid).and_then(|m| m.get(subject)).copied())
    }

    async fn allocated_ports(&self) -> Result<HashSet<u16>, StoreError> {
        Ok(self.lock().apps.values().filter(|a| !a.is_http()).filter_map(|a| a.connection.port).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Connection, ConnectionProtocol, MountModes, Volume, VolumeType};
    use crate::test_support::fixture_app;

    #[tokio::test]
    async fn find_is_namespace_scoped() {
        let store = MemoryStore::new();
        store.insert_app(fixture_app("a1"));
        assert!(store.find("ns-test", "a1").await.unwrap().is_some());
        assert!(store.find("other", "a1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_volumes_clears_pending_list() {
        let store = MemoryStore::new();
        let mut app = fixture_app("a2");
        app.volumes.push(Volume { volid: "v1".into(), kind: VolumeType::Fs, size: 1, mount_path: "/d".into(), modes: MountModes::default(), secretid: None });
        app.volumes_to_delete.push("v1".into());
        store.insert_app(app);
        store.remove_volumes("a2", &["v1".into()]).await.unwrap();
        let app = store.get("a2").unwrap();
        assert!(app.volumes.is_empty());
        assert!(app.volumes_to_delete.is_empty());
    }

    #[tokio::test]
    async fn allocated_ports_skip_http() {
        let store = MemoryStore::new();
        store.insert_app(fixture_app("h"));
        let mut tcp = fixture_app("t");
        tcp.connection = Connection { protocol: ConnectionProtocol::Tcp, port: Some(31001) };
        store.insert_app(tcp);
        assert_eq!(store.allocated_ports().await.unwrap(), HashSet::from([31001]));
    }

    #[test]
    fn snapshot_seed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let snap = StoreSnapshot { apps: vec![fixture_app("s1")], secrets: vec![], roles: BTreeMap::from([("ns-test".to_string(), BTreeMap::from([("alice".to_string(), Role::User)]))]) };
        std::io::Write::write_all(&mut f, serde_json::to_string(&snap).unwrap().as_bytes()).unwrap();
        let store = MemoryStore::from_snapshot_file(f.path()).unwrap();
        assert!(store.get("s1").is_some());
        assert_eq!(store.lock().roles["ns-test"]["alice"], Role::User);
    }

    #[tokio::test]
    async fn snapshot_file_round_trip_keeps_state_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        let store = MemoryStore::new();
        store.insert_app(fixture_app("w1"));
        store.set_state("w1", AppState::Active).await.unwrap();
        store.write_snapshot_file(&path).unwrap();
        let reread = MemoryStore::from_snapshot_file(&path).unwrap();
        assert_eq!(reread.get("w1").unwrap().state, AppState::Active);
    }
}
