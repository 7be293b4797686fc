//! The in-memory vector store: named collections of embedded entries.
//!
//! Collections are insertion-ordered; the order carries no search semantics
//! but is the deterministic tie-break for equal similarity scores and keeps
//! round-trips through the persistence layer stable.
//!
//! All reads and mutations go through one mutex, so a query never observes a
//! half-applied mutation. [`VectorStore::insert_many`] builds its entries
//! before taking the lock and splices them in as a single unit.

use std::{
    collections::BTreeMap,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    query,
};

/// The input kind an embedding represents. Determines which provider produces
/// the vector and which entries a query is compared against.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    #[default]
    Text,
    Image,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
        }
    }

    /// Parse a modality tag as it appears on the wire (`"text"`, `"image"`).
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "text" => Ok(Modality::Text),
            "image" => Ok(Modality::Image),
            other => {
                Err(Error::Config(format!("unsupported modality: {other}")))
            }
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to a stored entry.
///
/// The well-known fields are typed; anything else round-trips through `extra`
/// so arbitrary `string -> value` metadata survives a save/load cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub modality: Modality,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One stored record: vector, precomputed magnitude, metadata, unique id.
///
/// Invariant: `magnitude` always equals the L2 norm of `vector` at the moment
/// of last write. It is never mutated independently; the only way to change a
/// vector is to replace the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub vector: Vec<f32>,
    pub magnitude: f32,
    pub meta: EntryMeta,
}

/// An entry before the store has stamped it: no id, no magnitude yet.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryDraft {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub meta: EntryMeta,
}

impl EntryDraft {
    pub fn new(vector: Vec<f32>, meta: EntryMeta) -> Self {
        Self { vector, meta }
    }

    fn stamp(self) -> Entry {
        let magnitude = query::normalize(&self.vector);
        Entry {
            id: uuid::Uuid::new_v4().to_string(),
            vector: self.vector,
            magnitude,
            meta: self.meta,
        }
    }
}

struct StoreState {
    collections: BTreeMap<String, Vec<Entry>>,
    active: String,
}

/// Named, insertion-ordered collections of entries behind one mutex.
///
/// Mutation and query operations implicitly target the active collection,
/// chosen when the store is created. Entries of different vector lengths
/// (different modalities) may coexist in one collection; the query engine
/// keeps them mutually invisible during similarity search.
pub struct VectorStore {
    inner: Mutex<StoreState>,
}

impl VectorStore {
    /// Create a store whose active collection is `active` (created empty).
    pub fn new(active: &str) -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(active.to_string(), Vec::new());

        Self {
            inner: Mutex::new(StoreState {
                collections,
                active: active.to_string(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // A poisoned lock means a panic mid-mutation; propagating the panic
        // is the only sound option for an in-memory store.
        self.inner.lock().expect("vector store lock poisoned")
    }

    pub fn active_collection(&self) -> String {
        self.lock().active.clone()
    }

    /// Create a collection if absent. Re-creating an existing collection is a
    /// diagnostic, not an error.
    pub fn create_collection(&self, name: &str) {
        let mut state = self.lock();
        if state.collections.contains_key(name) {
            tracing::debug!(collection = name, "collection already exists");
            return;
        }
        state.collections.insert(name.to_string(), Vec::new());
    }

    /// Stamp and append one entry to the active collection.
    ///
    /// The entry is visible to any `find` issued after this returns, even
    /// though the durable copy is deferred to the persistence layer.
    pub fn insert_one(&self, draft: EntryDraft) -> Result<Entry> {
        let entry = draft.stamp();
        let mut state = self.lock();
        let active = state.active.clone();
        Self::active_mut(&mut state, &active)?.push(entry.clone());
        Ok(entry)
    }

    /// Stamp and append a batch of entries as one atomic unit.
    ///
    /// The entries are built outside the lock and spliced in together, so a
    /// concurrent `find` sees either none of the batch or all of it.
    pub fn insert_many(&self, drafts: Vec<EntryDraft>) -> Result<Vec<Entry>> {
        let entries: Vec<Entry> =
            drafts.into_iter().map(EntryDraft::stamp).collect();

        let mut state = self.lock();
        let active = state.active.clone();
        Self::active_mut(&mut state, &active)?
            .extend(entries.iter().cloned());
        Ok(entries)
    }

    /// Remove the entry with the given id. No-op when absent.
    pub fn delete_one(&self, id: &str) -> Result<bool> {
        let mut state = self.lock();
        let active = state.active.clone();
        let entries = Self::active_mut(&mut state, &active)?;

        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                entries.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the first entry whose `meta.file_path` matches with a freshly
    /// stamped entry (new id, new magnitude). Never inserts when nothing
    /// matches; insertion is the caller's job via the embed-and-insert path.
    ///
    /// Only the first match is replaced. Documents ingested as multiple
    /// chunks under one path are instead refreshed by the sync controller,
    /// which removes all chunks and re-ingests.
    pub fn update_one(
        &self,
        file_path: &str,
        draft: EntryDraft,
    ) -> Result<Option<Entry>> {
        let entry = draft.stamp();
        let mut state = self.lock();
        let active = state.active.clone();
        let entries = Self::active_mut(&mut state, &active)?;

        let Some(slot) = entries
            .iter_mut()
            .find(|e| e.meta.file_path.as_deref() == Some(file_path))
        else {
            return Ok(None);
        };

        *slot = entry.clone();
        Ok(Some(entry))
    }

    /// Remove every entry whose `meta.file_path` matches. Returns the number
    /// removed. The caller is responsible for scheduling persistence.
    pub fn remove_file(&self, file_path: &str) -> Result<usize> {
        let mut state = self.lock();
        let active = state.active.clone();
        let entries = Self::active_mut(&mut state, &active)?;

        let before = entries.len();
        entries.retain(|e| e.meta.file_path.as_deref() != Some(file_path));
        Ok(before - entries.len())
    }

    /// Whether any entry in the active collection points at `file_path`.
    pub fn has_file(&self, file_path: &str) -> bool {
        let state = self.lock();
        state
            .collections
            .get(&state.active)
            .is_some_and(|entries| {
                entries
                    .iter()
                    .any(|e| e.meta.file_path.as_deref() == Some(file_path))
            })
    }

    /// Run `f` against the active collection's entries under the store lock.
    ///
    /// This is the query engine's scan entry point; nothing else reads the
    /// vectors directly.
    pub fn with_active<R>(&self, f: impl FnOnce(&[Entry]) -> R) -> Result<R> {
        let state = self.lock();
        let entries = state.collections.get(&state.active).ok_or_else(|| {
            Error::NotFound {
                kind: "collection",
                name: state.active.clone(),
            }
        })?;
        Ok(f(entries))
    }

    pub fn active_len(&self) -> usize {
        let state = self.lock();
        state
            .collections
            .get(&state.active)
            .map_or(0, |entries| entries.len())
    }

    pub fn active_is_empty(&self) -> bool {
        self.active_len() == 0
    }

    /// Clone every collection for the persistence snapshot.
    pub fn snapshot(&self) -> Vec<(String, Vec<Entry>)> {
        let state = self.lock();
        state
            .collections
            .iter()
            .map(|(name, entries)| (name.clone(), entries.clone()))
            .collect()
    }

    /// Per-collection entry counts.
    pub fn stats(&self) -> Vec<(String, usize)> {
        let state = self.lock();
        state
            .collections
            .iter()
            .map(|(name, entries)| (name.clone(), entries.len()))
            .collect()
    }

    /// Replace the collection contents from loaded durable state, preserving
    /// record order. The active collection stays registered even when the
    /// durable file had no entries for it.
    pub fn hydrate(&self, collections: BTreeMap<String, Vec<Entry>>) {
        let mut state = self.lock();
        let active = state.active.clone();
        state.collections = collections;
        state.collections.entry(active).or_default();
    }

    fn active_mut<'a>(
        state: &'a mut StoreState,
        active: &str,
    ) -> Result<&'a mut Vec<Entry>> {
        state
            .collections
            .get_mut(active)
            .ok_or_else(|| Error::NotFound {
                kind: "collection",
                name: active.to_string(),
            })
    }
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore").finish_non_exhaustive()
    }
}
