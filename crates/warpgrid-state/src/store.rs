//! StateStore: redb-backed state persistence for WarpGrid.
//!
//! Provides typed access to applications and the version status. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Mutations of an application go through [`StateStore::lock_and_store`],
//! which holds a per-application lock around the read, the mutation and the
//! write. Different applications never contend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type LockMap = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on one application. Released on drop.
pub struct ApplicationLock {
    application: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl ApplicationLock {
    pub fn application(&self) -> &str {
        &self.application
    }
}

impl Drop for ApplicationLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own reference, so an entry only the map refers
        // to is idle and can go.
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(&self.application).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
            locks.remove(&self.application);
        }
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    locks: LockMap,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(SYSTEM).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Applications ───────────────────────────────────────────────

    /// Insert or update an application.
    pub fn put_application(&self, application: &Application) -> StateResult<()> {
        let key = application.id.as_str();
        let value = serde_json::to_vec(application).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "application stored");
        Ok(())
    }

    /// Get an application by id.
    pub fn get_application(&self, id: &str) -> StateResult<Option<Application>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let application: Application =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(application))
            }
            None => Ok(None),
        }
    }

    /// Load an application which must exist.
    pub fn load(&self, id: &str) -> StateResult<Application> {
        self.get_application(id)?
            .ok_or_else(|| StateError::NotFound(format!("application {id}")))
    }

    /// List the ids of all applications.
    pub fn list_application_ids(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    /// List all applications.
    pub fn list_applications(&self) -> StateResult<Vec<Application>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let application: Application =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(application);
        }
        Ok(results)
    }

    /// Delete an application by id. Returns true if it existed.
    pub fn delete_application(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "application deleted");
        Ok(existed)
    }

    // ── Locking ────────────────────────────────────────────────────

    /// Acquire the exclusive lock of an application, waiting at most `timeout`.
    pub async fn lock(&self, id: &str, timeout: Duration) -> StateResult<ApplicationLock> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(id.to_string()).or_default().clone()
        };
        let guard = tokio::time::timeout(timeout, mutex.lock_owned())
            .await
            .map_err(|_| StateError::LockTimeout(id.to_string()))?;
        Ok(ApplicationLock {
            application: id.to_string(),
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    /// Read-modify-write of one application under its lock.
    ///
    /// The mutator receives the current snapshot and returns the snapshot to
    /// store along with a result. If the mutator fails, nothing is written.
    pub async fn lock_and_store<T, E, F>(&self, id: &str, timeout: Duration, mutator: F) -> Result<T, E>
    where
        F: FnOnce(Application) -> Result<(Application, T), E>,
        E: From<StateError>,
    {
        let _lock = self.lock(id, timeout).await?;
        let current = self.load(id)?;
        let (updated, result) = mutator(current.clone())?;
        if updated != current {
            self.put_application(&updated)?;
        }
        Ok(result)
    }

    // ── Version status ─────────────────────────────────────────────

    pub fn put_version_status(&self, status: &VersionStatus) -> StateResult<()> {
        let value = serde_json::to_vec(status).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SYSTEM).map_err(map_err!(Table))?;
            table
                .insert(VERSION_STATUS_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(system_version = %status.system_version, "version status stored");
        Ok(())
    }

    pub fn get_version_status(&self) -> StateResult<Option<VersionStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SYSTEM).map_err(map_err!(Table))?;
        match table.get(VERSION_STATUS_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let status: VersionStatus =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use warp_core::{ApplicationRevision, DeploymentSpec, InstanceSpec, RevisionId, Step, Version};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn test_application(id: &str) -> Application {
        let spec = DeploymentSpec::single(InstanceSpec::new("default", vec![Step::region("us-west-1")])).unwrap();
        Application::new(id, spec, at(1000))
    }

    // ── Application CRUD ───────────────────────────────────────────

    #[test]
    fn application_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let app = test_application("tenant.app");

        store.put_application(&app).unwrap();
        let retrieved = store.get_application("tenant.app").unwrap();

        assert_eq!(retrieved, Some(app));
    }

    #[test]
    fn load_missing_application_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(matches!(store.load("nope.nothing"), Err(StateError::NotFound(_))));
    }

    #[test]
    fn application_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_application(&test_application("t.a")).unwrap();
        store.put_application(&test_application("t.b")).unwrap();

        assert_eq!(store.list_application_ids().unwrap(), vec!["t.a", "t.b"]);
        assert_eq!(store.list_applications().unwrap().len(), 2);

        assert!(store.delete_application("t.a").unwrap());
        assert!(!store.delete_application("t.a").unwrap());
        assert_eq!(store.list_application_ids().unwrap(), vec!["t.b"]);
    }

    // ── Locked read-modify-write ───────────────────────────────────

    #[tokio::test]
    async fn lock_and_store_commits_mutation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_application(&test_application("t.a")).unwrap();

        let count = store
            .lock_and_store("t.a", Duration::from_secs(1), |app| {
                let app = app.with_revision(ApplicationRevision::new(1, at(2000)));
                let count = app.revisions.len();
                Ok::<_, StateError>((app, count))
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        let stored = store.load("t.a").unwrap();
        assert_eq!(stored.latest_revision().unwrap().id, RevisionId::new(1));
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let store = StateStore::open_in_memory().unwrap();
        let app = test_application("t.a");
        store.put_application(&app).unwrap();

        let result: StateResult<()> = store
            .lock_and_store("t.a", Duration::from_secs(1), |_| {
                Err(StateError::NotFound("instance".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.load("t.a").unwrap(), app);
    }

    #[tokio::test]
    async fn lock_times_out_while_held() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_application(&test_application("t.a")).unwrap();

        let held = store.lock("t.a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(held.application(), "t.a");

        let contended = store.lock("t.a", Duration::from_millis(20)).await;
        assert!(matches!(contended, Err(StateError::LockTimeout(_))));

        // Other applications are unaffected.
        assert!(store.lock("t.b", Duration::from_millis(20)).await.is_ok());

        drop(held);
        assert!(store.lock("t.a", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn released_locks_are_forgotten() {
        let store = StateStore::open_in_memory().unwrap();
        let entries = |store: &StateStore| store.locks.lock().unwrap().len();

        let first = store.lock("t.a", Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.lock("t.a", Duration::from_secs(5)).await.map(drop) })
        };
        while Arc::strong_count(store.locks.lock().unwrap().get("t.a").unwrap()) < 3 {
            tokio::task::yield_now().await;
        }

        // The waiter still needs the entry.
        drop(first);
        waiter.await.unwrap().unwrap();
        assert_eq!(entries(&store), 0);

        for id in ["t.b", "t.c", "t.d"] {
            let _ = store.lock(id, Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(entries(&store), 0);
    }

    // ── Version status ─────────────────────────────────────────────

    #[test]
    fn version_status_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_version_status().unwrap().is_none());

        let status = VersionStatus::new(Version::new(8, 1, 0)).with_version(Version::new(8, 1, 0), Confidence::High);
        store.put_version_status(&status).unwrap();

        assert_eq!(store.get_version_status().unwrap(), Some(status));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_application(&test_application("prod.api")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let app = store.get_application("prod.api").unwrap();
        assert!(app.is_some());
        assert!(app.unwrap().instance("default").is_some());
    }
}
