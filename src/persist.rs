//! Debounced, atomic, crash-tolerant persistence for the vector store.
//!
//! A background task owns all durable writes. Mutations mark the store dirty;
//! the task waits out a quiet period so bursts coalesce into one write, then
//! snapshots the store and writes the full snapshot to a temporary file which
//! is renamed over the durable path. A reader can never observe a
//! half-written file, and because a single task performs every write there is
//! never more than one write in flight. A mark arriving mid-write re-arms the
//! loop, so nothing is lost.
//!
//! Durable format: newline-delimited JSON, one record per entry:
//! `{"collection": s, "id": s, "vector": [f...], "meta": {...}, "magnitude": f}`.
//! A legacy whole-file object keyed by collection name is accepted on read.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    store::{Entry, EntryMeta, VectorStore},
};

/// One durable record. Field order matches the wire format.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    collection: String,
    id: String,
    vector: Vec<f32>,
    meta: EntryMeta,
    magnitude: f32,
}

/// Legacy whole-object entry shape: `{vector, meta, magnitude, id}`.
#[derive(Debug, Deserialize)]
struct LegacyEntry {
    vector: Vec<f32>,
    #[serde(default)]
    meta: EntryMeta,
    magnitude: f32,
    id: String,
}

enum SaveRequest {
    Debounced,
    Immediate(oneshot::Sender<()>),
}

/// Handle to the background save task.
pub struct Persister {
    tx: mpsc::UnboundedSender<SaveRequest>,
}

impl Persister {
    /// Spawn the save task for `store`, writing to `path` after `debounce`
    /// of quiet. Must be called within a tokio runtime.
    pub fn spawn(
        store: Arc<VectorStore>,
        path: PathBuf,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(save_loop(store, path, debounce, rx));
        Self { tx }
    }

    /// Mark the store dirty, (re)starting the quiet-period timer.
    pub fn mark_dirty(&self) {
        let _ = self.tx.send(SaveRequest::Debounced);
    }

    /// Write the current snapshot now, skipping the quiet period, and wait
    /// for the write to finish.
    pub async fn save_now(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(SaveRequest::Immediate(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

impl std::fmt::Debug for Persister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persister").finish_non_exhaustive()
    }
}

async fn save_loop(
    store: Arc<VectorStore>,
    path: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<SaveRequest>,
) {
    while let Some(request) = rx.recv().await {
        let mut acks = Vec::new();

        match request {
            SaveRequest::Immediate(ack) => acks.push(ack),
            SaveRequest::Debounced => {
                // Quiet period: every further mark restarts the timer; an
                // immediate request cuts it short.
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => break,
                        next = rx.recv() => match next {
                            Some(SaveRequest::Debounced) => continue,
                            Some(SaveRequest::Immediate(ack)) => {
                                acks.push(ack);
                                break;
                            }
                            None => break,
                        },
                    }
                }
            }
        }

        // A failed save leaves in-memory state untouched; the next mark
        // retries. There is no automatic immediate retry.
        if let Err(err) = write_snapshot(&store, &path) {
            tracing::error!(
                path = %path.display(),
                error = %err,
                "save failed, in-memory state retained"
            );
        }

        for ack in acks {
            let _ = ack.send(());
        }
    }
}

/// Create all missing parent directories of `path`.
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Serialize the full store snapshot and atomically replace the durable file.
///
/// The snapshot is written to a temporary file in the destination directory
/// and renamed over the durable path, so readers see either the old file or
/// the new one, never a partial write.
pub fn write_snapshot(store: &VectorStore, path: &Path) -> Result<()> {
    ensure_directory_exists(path)?;

    let dir = path.parent().ok_or_else(|| {
        Error::Persistence(format!(
            "durable path has no parent directory: {}",
            path.display()
        ))
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut records = 0usize;

    for (collection, entries) in store.snapshot() {
        for entry in entries {
            let record = Record {
                collection: collection.clone(),
                id: entry.id,
                vector: entry.vector,
                meta: entry.meta,
                magnitude: entry.magnitude,
            };
            serde_json::to_writer(&mut tmp, &record)?;
            tmp.write_all(b"\n")?;
            records += 1;
        }
    }

    tmp.flush()?;
    tmp.persist(path).map_err(|e| {
        Error::Persistence(format!("atomic rename failed: {e}"))
    })?;

    tracing::debug!(records, path = %path.display(), "snapshot written");
    Ok(())
}

/// Rehydrate the store from the durable file. Returns the number of entries
/// loaded.
///
/// Only runs when the active collection is empty, so stale disk state can
/// never clobber live data. Malformed lines are skipped with a warning; they
/// never abort the load.
pub fn load(store: &VectorStore, path: &Path) -> Result<usize> {
    if !path.exists() {
        return Ok(0);
    }
    if !store.active_is_empty() {
        tracing::debug!("active collection not empty, skipping load");
        return Ok(0);
    }

    let contents = std::fs::read_to_string(path)?;

    let collections = match parse_legacy(&contents) {
        Some(collections) => collections,
        None => parse_records(&contents),
    };

    let loaded = collections.values().map(Vec::len).sum();
    store.hydrate(collections);
    Ok(loaded)
}

fn parse_records(contents: &str) -> BTreeMap<String, Vec<Entry>> {
    let mut collections: BTreeMap<String, Vec<Entry>> = BTreeMap::new();

    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(line) {
            Ok(record) => {
                collections.entry(record.collection).or_default().push(
                    Entry {
                        id: record.id,
                        vector: record.vector,
                        magnitude: record.magnitude,
                        meta: record.meta,
                    },
                );
            }
            Err(err) => {
                tracing::warn!(
                    line = lineno + 1,
                    error = %err,
                    "skipping malformed record"
                );
            }
        }
    }

    collections
}

/// Detect and parse the legacy whole-file format: a single JSON object
/// mapping collection names to entry arrays.
fn parse_legacy(contents: &str) -> Option<BTreeMap<String, Vec<Entry>>> {
    let value: serde_json::Value = serde_json::from_str(contents.trim()).ok()?;
    let object = value.as_object()?;

    // Every top-level value must be an array, otherwise this is a single
    // NDJSON record that happens to fill the whole file.
    if object.is_empty() || !object.values().all(|v| v.is_array()) {
        return None;
    }

    let mut collections = BTreeMap::new();
    for (name, entries) in object {
        let mut loaded = Vec::new();
        for entry in entries.as_array()? {
            match serde_json::from_value::<LegacyEntry>(entry.clone()) {
                Ok(legacy) => loaded.push(Entry {
                    id: legacy.id,
                    vector: legacy.vector,
                    magnitude: legacy.magnitude,
                    meta: legacy.meta,
                }),
                Err(err) => {
                    tracing::warn!(
                        collection = name.as_str(),
                        error = %err,
                        "skipping malformed legacy entry"
                    );
                }
            }
        }
        collections.insert(name.clone(), loaded);
    }

    Some(collections)
}
