//! The sync controller: keeps stored entries consistent with a filesystem
//! tree, by crawling directories and by consuming watch events.
//!
//! Per tracked file the lifecycle is Untracked → Tracked (first successful
//! embed and insert) → Tracked (replaced on change) → Untracked (all entries
//! removed on unlink). Nothing partial is ever persisted; a crash
//! mid-ingestion leaves the file simply not yet tracked.
//!
//! Every per-file failure (extraction, embedding) is logged and skipped; it
//! never aborts the surrounding batch or crawl.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc;

use crate::{
    chunking::chunk_text,
    config::Options,
    db::Database,
    error::{Error, Result},
    providers::{DocumentExtractor, ProviderRegistry},
    store::{EntryDraft, EntryMeta, Modality},
};

/// A filesystem change notification, pre-filtered to the configured extension
/// allow-list by the watch source. Per-path ordering is preserved by the
/// single consuming loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Add(PathBuf),
    Change(PathBuf),
    Unlink(PathBuf),
}

/// Counters for one directory crawl.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PullStats {
    /// Files successfully ingested.
    pub files: usize,
    /// Entries inserted across all ingested files.
    pub entries: usize,
    /// Files skipped: unrecognized extension, broken link, or a per-file
    /// ingestion failure.
    pub skipped: usize,
}

pub struct SyncController {
    db: Arc<Database>,
    providers: Arc<ProviderRegistry>,
    extractor: Arc<dyn DocumentExtractor>,
    options: Options,
}

impl SyncController {
    pub fn new(
        db: Arc<Database>,
        providers: Arc<ProviderRegistry>,
        extractor: Arc<dyn DocumentExtractor>,
        options: Options,
    ) -> Self {
        Self {
            db,
            providers,
            extractor,
            options,
        }
    }

    fn classify(&self, path: &Path) -> Option<Modality> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.options.modality_for_extension(&ext)
    }

    /// Recursively crawl `dir`, ingesting every file whose extension maps to
    /// a configured modality. Symlinks are resolved before classification;
    /// broken links are skipped and a canonicalized visited set breaks link
    /// cycles. One persistence schedule is issued after the whole crawl.
    pub async fn pull_documents(&self, dir: &Path) -> Result<PullStats> {
        let root = dir.canonicalize()?;
        let mut visited = HashSet::new();
        visited.insert(root.clone());

        let mut stack = vec![root];
        let mut stats = PullStats::default();

        while let Some(current) = stack.pop() {
            let entries = match std::fs::read_dir(&current) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(
                        dir = %current.display(),
                        error = %err,
                        "skipping unreadable directory"
                    );
                    continue;
                }
            };

            let mut paths: Vec<PathBuf> =
                entries.flatten().map(|e| e.path()).collect();
            paths.sort();

            for path in paths {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if name.starts_with('.') {
                    continue;
                }

                // Resolve links before classification; an unresolvable link
                // is skipped while its siblings continue.
                let resolved = match path.canonicalize() {
                    Ok(resolved) => resolved,
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "skipping unresolvable path"
                        );
                        stats.skipped += 1;
                        continue;
                    }
                };

                if resolved.is_dir() {
                    if visited.insert(resolved.clone()) {
                        stack.push(resolved);
                    }
                    continue;
                }

                let Some(modality) = self.classify(&resolved) else {
                    stats.skipped += 1;
                    continue;
                };

                match self.ingest_file(&resolved, modality).await {
                    Ok(inserted) => {
                        stats.files += 1;
                        stats.entries += inserted;
                    }
                    Err(err) => {
                        tracing::warn!(
                            path = %resolved.display(),
                            error = %err,
                            "skipping file after ingestion failure"
                        );
                        stats.skipped += 1;
                    }
                }
            }
        }

        self.db.schedule_save();
        Ok(stats)
    }

    /// Consume watch events until the channel closes.
    pub async fn watch_documents(&self, mut rx: mpsc::Receiver<WatchEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: WatchEvent) {
        // Watch sources do not guarantee canonical spellings; normalize so
        // event paths always match the keys the crawl stored.
        let result = match event {
            WatchEvent::Add(path) => {
                self.handle_add(&resolve_event_path(&path)).await
            }
            WatchEvent::Change(path) => self
                .update_file(&resolve_event_path(&path))
                .await
                .map(|_| ()),
            WatchEvent::Unlink(path) => {
                self.handle_unlink(&resolve_event_path(&path)).await
            }
        };

        if let Err(err) = result {
            tracing::warn!(error = %err, "watch event handling failed");
        }
    }

    async fn handle_add(&self, path: &Path) -> Result<()> {
        // Idempotent startup protection: watchers replay existing files as
        // adds, which must not re-ingest already tracked paths.
        if self.db.store().has_file(&path_key(path)) {
            tracing::debug!(path = %path.display(), "already tracked");
            return Ok(());
        }
        self.add_file(path).await?;
        Ok(())
    }

    async fn handle_unlink(&self, path: &Path) -> Result<()> {
        let removed = self.db.remove_file(&path_key(path)).await?;
        tracing::info!(
            path = %path.display(),
            entries = removed,
            "file removed"
        );
        Ok(())
    }

    /// Ingest a file and schedule a save. Errors when the extension maps to
    /// no configured modality.
    pub async fn add_file(&self, path: &Path) -> Result<usize> {
        let modality = self.classify(path).ok_or_else(|| {
            Error::Config(format!(
                "no modality configured for file: {}",
                path.display()
            ))
        })?;

        let inserted = self.ingest_file(path, modality).await?;
        self.db.schedule_save();
        Ok(inserted)
    }

    /// Re-extract, re-embed, and replace every entry for a changed file.
    ///
    /// The replacement batch is built first; existing entries are removed
    /// only once it exists, so a failed re-extract or re-embed (or a file
    /// that now extracts to nothing) leaves them untouched. The removal and
    /// re-insert are two synchronous store calls with no await between them,
    /// so multi-chunk documents never leave stale chunks behind. Schedules a
    /// save on success.
    pub async fn update_file(&self, path: &Path) -> Result<usize> {
        let drafts = match self.classify(path) {
            Some(Modality::Text) => self.text_drafts(path).await?,
            Some(Modality::Image) => vec![self.image_draft(path).await?],
            None => Vec::new(),
        };

        if drafts.is_empty() {
            tracing::warn!(
                path = %path.display(),
                "change produced no entries, keeping existing"
            );
            return Ok(0);
        }

        self.db.store().remove_file(&path_key(path))?;
        let inserted = drafts.len();
        self.db.store().insert_many(drafts)?;
        self.db.schedule_save();
        Ok(inserted)
    }

    async fn ingest_file(
        &self,
        path: &Path,
        modality: Modality,
    ) -> Result<usize> {
        match modality {
            Modality::Text => self.ingest_text(path).await,
            Modality::Image => self.add_item(path).await,
        }
    }

    async fn ingest_text(&self, path: &Path) -> Result<usize> {
        let drafts = self.text_drafts(path).await?;
        let inserted = drafts.len();
        if inserted > 0 {
            self.db.store().insert_many(drafts)?;
        }
        Ok(inserted)
    }

    /// Extract and embed a text file into entry drafts without touching the
    /// store. Empty extraction is tolerated: zero chunks, zero drafts.
    async fn text_drafts(&self, path: &Path) -> Result<Vec<EntryDraft>> {
        let extracted = self.extractor.extract(path);
        if extracted.text.trim().is_empty() {
            tracing::debug!(path = %path.display(), "no text extracted");
            return Ok(Vec::new());
        }

        let file_path = path_key(path);
        let title = extract_title(&extracted.text, path);
        let chunks = chunk_text(
            &extracted.text,
            self.options.chunk_size,
            self.options.min_chunk_size,
            self.options.overlap,
        );

        let mut drafts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector =
                self.providers.embed(&chunk.text, Modality::Text).await?;
            drafts.push(EntryDraft::new(
                vector,
                EntryMeta {
                    content: Some(chunk.text),
                    file_path: Some(file_path.clone()),
                    title: Some(title.clone()),
                    modality: Modality::Text,
                    ..Default::default()
                },
            ));
        }
        Ok(drafts)
    }

    async fn image_draft(&self, path: &Path) -> Result<EntryDraft> {
        let file_path = path_key(path);
        let vector =
            self.providers.embed(&file_path, Modality::Image).await?;

        Ok(EntryDraft::new(
            vector,
            EntryMeta {
                file_path: Some(file_path),
                title: Some(file_stem(path)),
                modality: Modality::Image,
                ..Default::default()
            },
        ))
    }

    /// Ingest a single non-text item (an image) as one entry whose vector
    /// embeds the file itself.
    pub async fn add_item(&self, path: &Path) -> Result<usize> {
        let draft = self.image_draft(path).await?;
        self.db.store().insert_one(draft)?;
        Ok(1)
    }
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController").finish_non_exhaustive()
    }
}

/// The string form of a path as stored in `meta.file_path`.
fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Canonicalize a watch event path. An unlinked file no longer resolves, so
/// fall back to canonicalizing the parent and re-joining the file name.
fn resolve_event_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|parent| parent.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

/// Extract a title: the first markdown heading, else the filename stem.
fn extract_title(content: &str, path: &Path) -> String {
    for line in content.lines() {
        if let Some(heading) = line.trim().strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }
    file_stem(path)
}
