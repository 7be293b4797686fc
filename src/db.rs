//! The database handle: one vector store plus its persistence schedule.
//!
//! Created by an initializer and passed explicitly to every operation — there
//! is no process-wide database, so independent instances can coexist in one
//! process. The mutation surface here mirrors the store's but schedules a
//! durable save per contract; the sync controller instead batches its own
//! scheduling around whole crawls via [`Database::store`] and
//! [`Database::schedule_save`].

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use crate::{
    config::Options,
    data_dir::DataDir,
    error::Result,
    persist::{self, Persister},
    store::{Entry, EntryDraft, VectorStore},
};

pub struct Database {
    store: Arc<VectorStore>,
    persister: Persister,
    path: PathBuf,
}

impl Database {
    /// Open (or create) a database: resolve the durable path, rehydrate the
    /// store from disk when present, and start the save task.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(
        options: &Options,
        data_dir_override: Option<&Path>,
    ) -> Result<Arc<Self>> {
        let explicit = options
            .storage_dir
            .as_deref()
            .or(data_dir_override);
        let data_dir = DataDir::resolve(explicit)?;
        let path = data_dir.database_file(&options.db_name);

        let store = Arc::new(VectorStore::new(&options.db_name));
        let loaded = persist::load(&store, &path)?;
        if loaded > 0 {
            tracing::info!(
                entries = loaded,
                path = %path.display(),
                "database loaded"
            );
        }

        let persister = Persister::spawn(
            store.clone(),
            path.clone(),
            Duration::from_millis(options.save_debounce_ms),
        );

        Ok(Arc::new(Self {
            store,
            persister,
            path,
        }))
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schedule_save(&self) {
        self.persister.mark_dirty();
    }

    /// Write the durable file now and wait for it.
    pub async fn flush(&self) {
        self.persister.save_now().await;
    }

    pub fn create_collection(&self, name: &str) {
        self.store.create_collection(name);
    }

    pub fn insert_one(&self, draft: EntryDraft) -> Result<Entry> {
        let entry = self.store.insert_one(draft)?;
        self.persister.mark_dirty();
        Ok(entry)
    }

    /// Insert a batch atomically; exactly one save is scheduled.
    pub fn insert_many(&self, drafts: Vec<EntryDraft>) -> Result<Vec<Entry>> {
        let entries = self.store.insert_many(drafts)?;
        self.persister.mark_dirty();
        Ok(entries)
    }

    pub fn delete_one(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_one(id)?;
        self.persister.mark_dirty();
        Ok(deleted)
    }

    pub fn update_one(
        &self,
        file_path: &str,
        draft: EntryDraft,
    ) -> Result<Option<Entry>> {
        let replaced = self.store.update_one(file_path, draft)?;
        self.persister.mark_dirty();
        Ok(replaced)
    }

    /// Remove all entries for a path. Per the store contract this does not
    /// schedule persistence itself; this wrapper flushes immediately because
    /// file removal is low-frequency and data-loss-sensitive.
    pub async fn remove_file(&self, file_path: &str) -> Result<usize> {
        let removed = self.store.remove_file(file_path)?;
        self.flush().await;
        Ok(removed)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
