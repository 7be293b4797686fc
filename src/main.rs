use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, FindArgs, PullArgs};
use nectar::{
    Database,
    Options,
    ProviderRegistry,
    error::Result,
    protocol::ProtocolServer,
    providers::PlainTextExtractor,
    query::{self, FindQuery},
    sync::SyncController,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("NECTAR_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    // stdout carries protocol responses and results; diagnostics stay on
    // stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Command::Serve => {
            ProtocolServer::new(cli.data_dir.clone()).run().await?;
        }
        Command::Pull(ref args) => {
            cmd_pull(&cli, args).await?;
        }
        Command::Find(ref args) => {
            cmd_find(&cli, args).await?;
        }
        Command::Status(ref args) => {
            cmd_status(&cli, args.json)?;
        }
    }

    Ok(())
}

async fn cmd_pull(cli: &Cli, args: &PullArgs) -> Result<()> {
    let options = Options::default();
    let db = Database::open(&options, cli.data_dir.as_deref())?;
    let providers =
        Arc::new(ProviderRegistry::http(options.embedding.clone()));
    let sync = SyncController::new(
        db.clone(),
        providers,
        Arc::new(PlainTextExtractor),
        options,
    );

    let stats = sync.pull_documents(&args.dir).await?;
    // Make the crawl durable before the process exits.
    db.flush().await;

    println!(
        "Ingested {} file(s), {} entr(ies); skipped {}.",
        stats.files, stats.entries, stats.skipped
    );
    Ok(())
}

async fn cmd_find(cli: &Cli, args: &FindArgs) -> Result<()> {
    let options = Options::default();
    let db = Database::open(&options, cli.data_dir.as_deref())?;
    let providers = ProviderRegistry::http(options.embedding.clone());

    let matches = query::find(
        db.store(),
        &providers,
        None,
        FindQuery::Text(args.query.clone()),
        args.count,
        options.rerank.max_chars,
    )
    .await?;

    if args.json {
        println!("{}", serde_json::to_string(&matches)?);
        return Ok(());
    }

    if matches.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for found in &matches {
        let meta = &found.entry.meta;
        println!(
            "{:.3}  {}",
            found.similarity,
            meta.title.as_deref().unwrap_or("(untitled)")
        );
        if let Some(path) = &meta.file_path {
            println!("       {path}");
        }
    }
    Ok(())
}

fn cmd_status(cli: &Cli, json: bool) -> Result<()> {
    let options = Options::default();
    let db = Database::open(&options, cli.data_dir.as_deref())?;
    let stats = db.store().stats();

    if json {
        let collections: serde_json::Map<String, serde_json::Value> = stats
            .iter()
            .map(|(name, count)| {
                (name.clone(), serde_json::Value::from(*count))
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "path": db.path(),
                "collections": collections,
            })
        );
    } else {
        println!("Durable file: {}", db.path().display());
        for (name, count) in &stats {
            println!("  {name}: {count} entr(ies)");
        }
    }
    Ok(())
}
