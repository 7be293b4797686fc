//! Line-oriented JSON control protocol over stdin/stdout.
//!
//! Each input line is one command `{"action": name, "args": {...}}`; each
//! output line is one response `{"data": any, "error": string|null}`. A
//! malformed line or unknown action produces an error response, never a
//! process exit, and the session continues. Diagnostics go to stderr via
//! `tracing`, keeping stdout exclusively for responses.
//!
//! Every action except `init` requires an initialized session; `init` parses
//! options from its args, opens the database, and wires the providers.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::{
    config::Options,
    db::Database,
    error::{Error, Result},
    providers::{
        DocumentExtractor,
        HttpReranker,
        PlainTextExtractor,
        ProviderRegistry,
        Reranker,
    },
    query::{self, FindQuery},
    store::{EntryDraft, Modality},
    sync::SyncController,
};

const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, Deserialize)]
struct Command {
    action: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct Response {
    data: serde_json::Value,
    error: Option<String>,
}

impl Response {
    fn ok(data: serde_json::Value) -> Self {
        Self { data, error: None }
    }

    fn err(message: String) -> Self {
        Self {
            data: serde_json::Value::Null,
            error: Some(message),
        }
    }

    fn encode(&self) -> String {
        // Response has no non-string keys, so serialization cannot fail.
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"data":null,"error":"encoding failed"}"#.to_string())
    }
}

/// Everything an initialized session holds. Built by `init`, replaced by a
/// subsequent `init`.
struct Session {
    db: Arc<Database>,
    providers: Arc<ProviderRegistry>,
    reranker: Option<Arc<dyn Reranker>>,
    sync: SyncController,
    options: Options,
}

impl Session {
    fn open(options: Options, data_dir: Option<&Path>) -> Result<Self> {
        let db = Database::open(&options, data_dir)?;
        let providers =
            Arc::new(ProviderRegistry::http(options.embedding.clone()));

        let reranker: Option<Arc<dyn Reranker>> = if options.rerank.enabled {
            let endpoint = options
                .rerank
                .endpoint
                .clone()
                .unwrap_or_else(|| options.embedding.endpoint.clone());
            Some(Arc::new(HttpReranker::new(
                endpoint,
                options.rerank.model.clone(),
            )))
        } else {
            None
        };

        let extractor: Arc<dyn DocumentExtractor> =
            Arc::new(PlainTextExtractor);
        let sync = SyncController::new(
            db.clone(),
            providers.clone(),
            extractor,
            options.clone(),
        );

        Ok(Self {
            db,
            providers,
            reranker,
            sync,
            options,
        })
    }
}

/// Protocol state machine: no session until `init` succeeds.
pub struct ProtocolServer {
    session: Option<Session>,
    data_dir: Option<PathBuf>,
}

impl ProtocolServer {
    pub fn new(data_dir: Option<PathBuf>) -> Self {
        Self {
            session: None,
            data_dir,
        }
    }

    /// Read commands from stdin and write one response line per command.
    pub async fn run(mut self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line).await;
            stdout.write_all(response.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }

        // Flush pending mutations before the session is dropped.
        if let Some(session) = &self.session {
            session.db.flush().await;
        }
        Ok(())
    }

    /// Handle one command line; always returns a response line.
    pub async fn handle_line(&mut self, line: &str) -> String {
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(err) => {
                return Response::err(format!("malformed command: {err}"))
                    .encode();
            }
        };

        tracing::debug!(action = %command.action, "command received");
        match self.dispatch(&command.action, command.args).await {
            Ok(data) => Response::ok(data).encode(),
            Err(err) => Response::err(err.to_string()).encode(),
        }
    }

    async fn dispatch(
        &mut self,
        action: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        if action == "init" {
            return self.init(args).await;
        }

        let session = self.session.as_ref().ok_or_else(|| {
            Error::Protocol("database not initialized".to_string())
        })?;

        match action {
            "addFile" => Self::add_file(session, args).await,
            "embed" => Self::embed(session, args).await,
            "find" => Self::find(session, args).await,
            "insertOne" => Self::insert_one(session, args),
            "deleteOne" => Self::delete_one(session, args),
            "updateOne" => Self::update_one(session, args),
            "removeFile" => Self::remove_file(session, args).await,
            other => {
                Err(Error::Protocol(format!("unknown action: {other}")))
            }
        }
    }

    async fn init(
        &mut self,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let options: Options = serde_json::from_value(args)
            .map_err(|e| Error::Protocol(format!("invalid options: {e}")))?;

        // A replaced session may still hold a pending debounced save; write
        // it out before the new session reads the durable file, so the old
        // persister cannot clobber it afterwards.
        if let Some(outgoing) = &self.session {
            outgoing.db.flush().await;
        }

        let session = Session::open(options, self.data_dir.as_deref())?;
        let data = serde_json::json!({
            "collection": session.options.db_name,
            "entries": session.db.store().active_len(),
            "path": session.db.path(),
        });

        self.session = Some(session);
        Ok(data)
    }

    async fn add_file(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            file_path: PathBuf,
        }

        let args: Args = parse_args(args)?;
        let inserted = session.sync.add_file(&args.file_path).await?;
        Ok(serde_json::json!({ "inserted": inserted }))
    }

    async fn embed(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Args {
            input: String,
            #[serde(rename = "type", default)]
            modality: Option<String>,
        }

        let args: Args = parse_args(args)?;
        let modality = match args.modality.as_deref() {
            Some(tag) => Modality::parse(tag)?,
            None => Modality::Text,
        };

        let vector = session.providers.embed(&args.input, modality).await?;
        Ok(serde_json::to_value(vector)?)
    }

    async fn find(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            #[serde(default)]
            query_vector: Option<Vec<f32>>,
            #[serde(default)]
            query: Option<String>,
            #[serde(default)]
            top_k: Option<usize>,
        }

        let args: Args = parse_args(args)?;
        let query = match (args.query_vector, args.query) {
            (Some(vector), _) => FindQuery::Vector(vector),
            (None, Some(text)) => FindQuery::Text(text),
            (None, None) => {
                return Err(Error::Protocol(
                    "find requires queryVector or query".to_string(),
                ));
            }
        };

        let matches = query::find(
            session.db.store(),
            &session.providers,
            session.reranker.as_deref(),
            query,
            args.top_k.unwrap_or(DEFAULT_TOP_K),
            session.options.rerank.max_chars,
        )
        .await?;

        Ok(serde_json::to_value(matches)?)
    }

    fn insert_one(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Args {
            entry: EntryDraft,
        }

        let args: Args = parse_args(args)?;
        let entry = session.db.insert_one(args.entry)?;
        Ok(serde_json::to_value(entry)?)
    }

    fn delete_one(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        struct Args {
            id: String,
        }

        let args: Args = parse_args(args)?;
        let deleted = session.db.delete_one(&args.id)?;
        Ok(serde_json::json!({ "deleted": deleted }))
    }

    fn update_one(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Query {
            file_path: String,
        }

        #[derive(Deserialize)]
        struct Args {
            query: Query,
            entry: EntryDraft,
        }

        let args: Args = parse_args(args)?;
        let replaced =
            session.db.update_one(&args.query.file_path, args.entry)?;
        Ok(serde_json::to_value(replaced)?)
    }

    async fn remove_file(
        session: &Session,
        args: serde_json::Value,
    ) -> Result<serde_json::Value> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Args {
            file_path: String,
        }

        let args: Args = parse_args(args)?;
        let removed = session.db.remove_file(&args.file_path).await?;
        Ok(serde_json::json!({ "removed": removed }))
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(
    args: serde_json::Value,
) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::Protocol(format!("invalid arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_line(storage: &Path) -> String {
        serde_json::json!({
            "action": "init",
            "args": { "storageDir": storage, "saveDebounceMs": 10 }
        })
        .to_string()
    }

    fn parsed(response: &str) -> (serde_json::Value, Option<String>) {
        let value: serde_json::Value =
            serde_json::from_str(response).unwrap();
        (
            value["data"].clone(),
            value["error"].as_str().map(str::to_string),
        )
    }

    #[tokio::test]
    async fn commands_before_init_fail_without_ending_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);

        let (_, error) = parsed(
            &server
                .handle_line(r#"{"action":"find","args":{"query":"x"}}"#)
                .await,
        );
        assert!(error.unwrap().contains("not initialized"));

        // The session recovers once init arrives.
        let (data, error) =
            parsed(&server.handle_line(&init_line(tmp.path())).await);
        assert!(error.is_none());
        assert_eq!(data["entries"], 0);
    }

    #[tokio::test]
    async fn malformed_and_unknown_commands_yield_error_responses() {
        let mut server = ProtocolServer::new(None);

        let (_, error) = parsed(&server.handle_line("not json").await);
        assert!(error.unwrap().contains("malformed"));

        let tmp = tempfile::tempdir().unwrap();
        server.handle_line(&init_line(tmp.path())).await;

        let (_, error) = parsed(
            &server.handle_line(r#"{"action":"frobnicate"}"#).await,
        );
        assert!(error.unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn insert_find_delete_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);
        server.handle_line(&init_line(tmp.path())).await;

        let insert = serde_json::json!({
            "action": "insertOne",
            "args": { "entry": {
                "vector": [1.0, 0.0],
                "meta": { "content": "hello" }
            }}
        });
        let (entry, error) =
            parsed(&server.handle_line(&insert.to_string()).await);
        assert!(error.is_none());
        let id = entry["id"].as_str().unwrap().to_string();

        let find = serde_json::json!({
            "action": "find",
            "args": { "queryVector": [1.0, 0.0], "topK": 5 }
        });
        let (matches, error) =
            parsed(&server.handle_line(&find.to_string()).await);
        assert!(error.is_none());
        assert_eq!(matches[0]["entry"]["id"], id.as_str());
        assert!((matches[0]["similarity"].as_f64().unwrap() - 1.0).abs() < 1e-6);

        let delete = serde_json::json!({
            "action": "deleteOne",
            "args": { "id": id }
        });
        let (data, error) =
            parsed(&server.handle_line(&delete.to_string()).await);
        assert!(error.is_none());
        assert_eq!(data["deleted"], true);
    }

    #[tokio::test]
    async fn find_requires_a_query() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);
        server.handle_line(&init_line(tmp.path())).await;

        let (_, error) = parsed(
            &server
                .handle_line(r#"{"action":"find","args":{"topK":3}}"#)
                .await,
        );
        assert!(error.unwrap().contains("queryVector or query"));
    }

    #[tokio::test]
    async fn update_one_replaces_matching_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);
        server.handle_line(&init_line(tmp.path())).await;

        let insert = serde_json::json!({
            "action": "insertOne",
            "args": { "entry": {
                "vector": [1.0],
                "meta": { "filePath": "/a.md" }
            }}
        });
        server.handle_line(&insert.to_string()).await;

        let update = serde_json::json!({
            "action": "updateOne",
            "args": {
                "query": { "filePath": "/a.md" },
                "entry": {
                    "vector": [2.0],
                    "meta": { "filePath": "/a.md" }
                }
            }
        });
        let (replaced, error) =
            parsed(&server.handle_line(&update.to_string()).await);
        assert!(error.is_none());
        assert_eq!(replaced["vector"][0], 2.0);

        // No match yields a null replacement, not an error.
        let miss = serde_json::json!({
            "action": "updateOne",
            "args": {
                "query": { "filePath": "/missing.md" },
                "entry": { "vector": [3.0] }
            }
        });
        let (replaced, error) =
            parsed(&server.handle_line(&miss.to_string()).await);
        assert!(error.is_none());
        assert!(replaced.is_null());
    }

    #[tokio::test]
    async fn remove_file_reports_removed_count() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);
        server.handle_line(&init_line(tmp.path())).await;

        for _ in 0..2 {
            let insert = serde_json::json!({
                "action": "insertOne",
                "args": { "entry": {
                    "vector": [1.0],
                    "meta": { "filePath": "/doc.md" }
                }}
            });
            server.handle_line(&insert.to_string()).await;
        }

        let remove = serde_json::json!({
            "action": "removeFile",
            "args": { "filePath": "/doc.md" }
        });
        let (data, error) =
            parsed(&server.handle_line(&remove.to_string()).await);
        assert!(error.is_none());
        assert_eq!(data["removed"], 2);
    }

    #[tokio::test]
    async fn reinit_flushes_pending_saves_of_the_outgoing_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);

        // A long debounce guarantees the insert is still pending when the
        // session is replaced.
        let init = serde_json::json!({
            "action": "init",
            "args": { "storageDir": tmp.path(), "saveDebounceMs": 60000 }
        })
        .to_string();
        server.handle_line(&init).await;

        let insert = serde_json::json!({
            "action": "insertOne",
            "args": { "entry": { "vector": [1.0, 2.0] } }
        });
        server.handle_line(&insert.to_string()).await;

        let (data, error) = parsed(&server.handle_line(&init).await);
        assert!(error.is_none());
        assert_eq!(data["entries"], 1);
    }

    #[tokio::test]
    async fn reinit_loads_previously_persisted_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let mut server = ProtocolServer::new(None);
        server.handle_line(&init_line(tmp.path())).await;

        let insert = serde_json::json!({
            "action": "insertOne",
            "args": { "entry": { "vector": [1.0, 2.0] } }
        });
        server.handle_line(&insert.to_string()).await;

        // removeFile of an untracked path flushes without removing anything,
        // making the insert durable before the session is replaced.
        let flush = serde_json::json!({
            "action": "removeFile",
            "args": { "filePath": "/nothing.md" }
        });
        server.handle_line(&flush.to_string()).await;

        let (data, error) =
            parsed(&server.handle_line(&init_line(tmp.path())).await);
        assert!(error.is_none());
        assert_eq!(data["entries"], 1);
    }
}
