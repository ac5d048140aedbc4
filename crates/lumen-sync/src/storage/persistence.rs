//! Document persistence provider
//!
//! Replays a project's stored snapshot and update log into the document on
//! startup, then streams every update it did not write itself into the log.
//! The `ready` signal fires once replay is done; callers deciding cold-start
//! precedence must wait for it. Load failures degrade to an empty document
//! with a warning, and failed writes are retried on the next change, so
//! persistence trouble never blocks editing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::error::{StorageError, StorageResult};
use super::schema;
use crate::config::SyncConfig;
use crate::models::now_ms;
use crate::registry::{DocHandle, Origin};

/// Commands sent to the persistence task
enum PersistenceCommand {
    /// Persist everything received so far and compact, then acknowledge
    Flush(oneshot::Sender<()>),
    /// Compact and stop
    Shutdown,
}

/// Direct access to the snapshot and update-log tables.
pub struct UpdateStore {
    conn: Connection,
}

impl UpdateStore {
    /// Open (and initialize if needed) the database at `path`.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| {
                    StorageError::CreateDirectory {
                        path: parent.to_path_buf(),
                        source,
                    }
                })?;
            }
        }
        let conn = Connection::open(path)?;
        if schema::needs_init(&conn) {
            schema::init_schema(&conn)?;
        }
        Ok(Self { conn })
    }

    /// All stored bytes for a project in replay order: the snapshot first,
    /// then logged updates oldest to newest.
    pub fn load(&self, project_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        let mut blobs = Vec::new();

        let snapshot: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT bytes FROM snapshots WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(snapshot) = snapshot {
            blobs.push(snapshot);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT bytes FROM update_log WHERE project_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![project_id], |row| row.get::<_, Vec<u8>>(0))?;
        for row in rows {
            blobs.push(row?);
        }

        Ok(blobs)
    }

    /// Append one update to a project's log.
    pub fn append(&self, project_id: &str, bytes: &[u8]) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO update_log (project_id, bytes, appended_at) VALUES (?1, ?2, ?3)",
            params![project_id, bytes, now_ms()],
        )?;
        Ok(())
    }

    /// Number of logged updates for a project.
    pub fn log_len(&self, project_id: &str) -> StorageResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM update_log WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Replace the snapshot and clear the log in one transaction.
    pub fn compact(&mut self, project_id: &str, snapshot: &[u8]) -> StorageResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (project_id, bytes, saved_at) VALUES (?1, ?2, ?3)",
            params![project_id, snapshot, now_ms()],
        )?;
        tx.execute(
            "DELETE FROM update_log WHERE project_id = ?1",
            params![project_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Whether a snapshot exists for a project.
    pub fn has_snapshot(&self, project_id: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM snapshots WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

/// Keeps one project's document durable in SQLite.
pub struct PersistenceProvider {
    origin: Origin,
    ready_rx: watch::Receiver<bool>,
    command_tx: mpsc::Sender<PersistenceCommand>,
    task: Option<JoinHandle<()>>,
}

impl PersistenceProvider {
    /// Spawn the persistence task for one project.
    pub fn spawn(config: &SyncConfig, project_id: &str, handle: Arc<DocHandle>) -> Self {
        let origin = Origin::generate("store");
        let (ready_tx, ready_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(16);

        let task = tokio::spawn(provider_task(
            config.sqlite_path(),
            config.compact_threshold,
            project_id.to_string(),
            handle,
            origin.clone(),
            ready_tx,
            command_rx,
        ));

        Self {
            origin,
            ready_rx,
            command_tx,
            task: Some(task),
        }
    }

    /// This provider's origin tag.
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether stored state has been replayed into the document.
    pub fn is_ready(&self) -> bool {
        *self.ready_rx.borrow()
    }

    /// Wait until stored state has been replayed into the document.
    pub async fn ready(&self) {
        let mut ready_rx = self.ready_rx.clone();
        loop {
            if *ready_rx.borrow() {
                return;
            }
            if ready_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Persist everything received so far and compact into a snapshot.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .command_tx
            .send(PersistenceCommand::Flush(ack_tx))
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Detach. The task compacts and exits on its own; safe to call more
    /// than once.
    pub fn destroy(&mut self) {
        let _ = self.command_tx.try_send(PersistenceCommand::Shutdown);
        // Dropping the join handle detaches; the task finishes its final
        // compaction in the background
        let _ = self.task.take();
    }
}

impl Drop for PersistenceProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn provider_task(
    db_path: PathBuf,
    compact_threshold: usize,
    project_id: String,
    handle: Arc<DocHandle>,
    origin: Origin,
    ready_tx: watch::Sender<bool>,
    mut command_rx: mpsc::Receiver<PersistenceCommand>,
) {
    // Subscribe before replay so nothing in between is missed; our own
    // replay applications come back tagged with our origin and are skipped.
    let mut updates = handle.subscribe_updates();

    let mut store = match UpdateStore::open(&db_path) {
        Ok(store) => Some(store),
        Err(error) => {
            tracing::error!(path = %db_path.display(), %error, "persistence disabled: could not open database");
            None
        }
    };

    if let Some(store) = store.as_ref() {
        match store.load(&project_id) {
            Ok(blobs) => {
                for bytes in blobs {
                    if let Err(error) = handle.apply_update(&bytes, Some(origin.clone())) {
                        tracing::warn!(project_id, %error, "discarding corrupt stored update; continuing with what loaded");
                    }
                }
            }
            Err(error) => {
                tracing::warn!(project_id, %error, "could not load stored state; starting empty");
            }
        }
    }

    let _ = ready_tx.send(true);

    // Updates that failed to write, retried on the next event
    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                let ack = match cmd {
                    Some(PersistenceCommand::Flush(ack)) => Some(ack),
                    Some(PersistenceCommand::Shutdown) | None => None,
                };
                // Drain updates already broadcast before this command
                drain_updates(&mut updates, &origin, &mut pending, &handle);
                if let Some(store) = store.as_mut() {
                    write_pending(store, &project_id, &mut pending);
                    compact(store, &project_id, &handle);
                }
                match ack {
                    Some(ack) => {
                        let _ = ack.send(());
                    }
                    None => break,
                }
            }

            event = updates.recv() => {
                match event {
                    Ok(event) => {
                        if event.origin.as_ref() == Some(&origin) {
                            continue;
                        }
                        pending.push_back(event.bytes);
                        if let Some(store) = store.as_mut() {
                            write_pending(store, &project_id, &mut pending);
                            let over_threshold = store
                                .log_len(&project_id)
                                .map(|len| len >= compact_threshold)
                                .unwrap_or(false);
                            if over_threshold {
                                compact(store, &project_id, &handle);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The document holds everything; recover by snapshotting
                        tracing::warn!(project_id, skipped, "update stream lagged; compacting from document");
                        pending.clear();
                        if let Some(store) = store.as_mut() {
                            compact(store, &project_id, &handle);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        if let Some(store) = store.as_mut() {
                            write_pending(store, &project_id, &mut pending);
                            compact(store, &project_id, &handle);
                        }
                        break;
                    }
                }
            }
        }
    }
}

/// Pull everything already sitting in the update stream into `pending`.
fn drain_updates(
    updates: &mut broadcast::Receiver<crate::registry::UpdateEvent>,
    origin: &Origin,
    pending: &mut VecDeque<Vec<u8>>,
    handle: &Arc<DocHandle>,
) {
    loop {
        match updates.try_recv() {
            Ok(event) => {
                if event.origin.as_ref() != Some(origin) {
                    pending.push_back(event.bytes);
                }
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "update stream lagged during drain");
                pending.clear();
                // Snapshot covers the gap; signal that by queueing the full doc
                pending.push_back(handle.snapshot());
            }
            Err(_) => break,
        }
    }
}

fn write_pending(store: &mut UpdateStore, project_id: &str, pending: &mut VecDeque<Vec<u8>>) {
    while let Some(bytes) = pending.front() {
        match store.append(project_id, bytes) {
            Ok(()) => {
                pending.pop_front();
            }
            Err(error) => {
                tracing::warn!(project_id, %error, queued = pending.len(), "failed to persist update; will retry on next change");
                break;
            }
        }
    }
}

fn compact(store: &mut UpdateStore, project_id: &str, handle: &Arc<DocHandle>) {
    let snapshot = handle.snapshot();
    if let Err(error) = store.compact(project_id, &snapshot) {
        tracing::warn!(project_id, %error, "compaction failed; log kept as is");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, EntityKind, Scene, Surface};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> SyncConfig {
        SyncConfig {
            data_dir: dir.path().to_path_buf(),
            ..SyncConfig::default()
        }
    }

    fn put_surface(handle: &DocHandle, name: &str) -> String {
        let entity: Entity = Surface::new(name).into();
        let id = entity.id().to_string();
        handle.mutate(|doc| doc.put(&entity)).unwrap();
        id
    }

    #[test]
    fn test_update_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lumen.db");
        let mut store = UpdateStore::open(&path).unwrap();

        assert!(store.load("p1").unwrap().is_empty());

        store.append("p1", &[1, 2, 3]).unwrap();
        store.append("p1", &[4, 5]).unwrap();
        store.append("other", &[9]).unwrap();
        assert_eq!(store.log_len("p1").unwrap(), 2);
        assert_eq!(store.load("p1").unwrap(), vec![vec![1, 2, 3], vec![4, 5]]);

        store.compact("p1", &[7, 7, 7]).unwrap();
        assert_eq!(store.log_len("p1").unwrap(), 0);
        assert!(store.has_snapshot("p1").unwrap());
        // Snapshot comes first on load
        assert_eq!(store.load("p1").unwrap(), vec![vec![7, 7, 7]]);
        // Other projects untouched
        assert_eq!(store.log_len("other").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let handle = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", handle.clone());
        provider.ready().await;

        let s1 = put_surface(&handle, "Wall");
        handle
            .mutate(|doc| doc.put(&Scene::new("Act I").into()))
            .unwrap();
        provider.flush().await;
        drop(provider);

        // A new session sees everything
        let reloaded = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", reloaded.clone());
        provider.ready().await;
        assert!(reloaded.collection(EntityKind::Surfaces).contains_key(&s1));
        assert_eq!(reloaded.collection(EntityKind::Scenes).len(), 1);
    }

    #[tokio::test]
    async fn test_flush_compacts_log() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let handle = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", handle.clone());
        provider.ready().await;

        put_surface(&handle, "A");
        put_surface(&handle, "B");
        provider.flush().await;

        let store = UpdateStore::open(&config.sqlite_path()).unwrap();
        assert_eq!(store.log_len("project-1").unwrap(), 0);
        assert!(store.has_snapshot("project-1").unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        {
            let mut store = UpdateStore::open(&config.sqlite_path()).unwrap();
            store.compact("project-1", b"garbage snapshot").unwrap();
        }

        let handle = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", handle.clone());
        provider.ready().await;

        // Degraded to empty, and still usable afterwards
        assert!(handle.collection(EntityKind::Surfaces).is_empty());
        let id = put_surface(&handle, "Fresh start");
        provider.flush().await;
        drop(provider);

        let reloaded = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", reloaded.clone());
        provider.ready().await;
        assert!(reloaded.collection(EntityKind::Surfaces).contains_key(&id));
    }

    #[tokio::test]
    async fn test_own_replay_is_not_relogged() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let handle = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", handle.clone());
        provider.ready().await;
        put_surface(&handle, "Once");
        provider.flush().await;
        drop(provider);

        // Replay applies the snapshot; its own application must not grow the log
        let reloaded = DocHandle::new("project-1");
        let provider = PersistenceProvider::spawn(&config, "project-1", reloaded.clone());
        provider.ready().await;
        provider.flush().await;
        drop(provider);

        let store = UpdateStore::open(&config.sqlite_path()).unwrap();
        assert_eq!(store.log_len("project-1").unwrap(), 0);
    }
}
