//! nectar - an embedded semantic document store.
//!
//! nectar keeps collections of embedded entries in memory, persists them as
//! newline-delimited JSON with debounced atomic writes, and answers
//! similarity queries with a two-stage cosine-then-rerank pipeline. Documents
//! enter the store through a directory crawler and a filesystem watch loop,
//! and external processes drive everything over a line-oriented JSON protocol
//! on stdin/stdout.
//!
//! # Quick start
//!
//! ```no_run
//! use nectar::{Database, EntryDraft, EntryMeta, Options, ProviderRegistry};
//! use nectar::query::{self, FindQuery};
//!
//! #[tokio::main]
//! async fn main() -> nectar::Result<()> {
//!     let options = Options::default();
//!     let db = Database::open(&options, None)?;
//!
//!     db.insert_one(EntryDraft::new(
//!         vec![0.1, 0.9],
//!         EntryMeta {
//!             content: Some("a stored passage".to_string()),
//!             ..Default::default()
//!         },
//!     ))?;
//!
//!     let providers = ProviderRegistry::http(options.embedding.clone());
//!     let matches = query::find(
//!         db.store(),
//!         &providers,
//!         None,
//!         FindQuery::Vector(vec![0.1, 0.9]),
//!         5,
//!         options.rerank.max_chars,
//!     )
//!     .await?;
//!
//!     for found in &matches {
//!         println!("{} (score: {:.3})", found.entry.id, found.similarity);
//!     }
//!
//!     db.flush().await;
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod config;
pub mod data_dir;
pub mod db;
pub mod error;
pub mod persist;
pub mod protocol;
pub mod providers;
pub mod query;
pub mod store;
pub mod sync;

pub use config::Options;
pub use data_dir::DataDir;
pub use db::Database;
pub use error::{Error, Result};
pub use providers::ProviderRegistry;
pub use store::{Entry, EntryDraft, EntryMeta, Modality, VectorStore};
