use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use marksync::config::{Cli, Command, Config};
use marksync::db::Database;
use marksync::error::{LedgerError, SyncError};
use marksync::ledger::Ledger;
use marksync::model::{BEGINNING_OF_TIME, format_timestamp};
use marksync::pocket::PocketClient;
use marksync::raindrop::RaindropClient;
use marksync::sync::{SyncEngine, SyncMode, SyncReport, SyncSettings};
use tracing_subscriber::EnvFilter;

const EXIT_FATAL: u8 = 1;
const EXIT_AUTH: u8 = 2;
const EXIT_CONFIG: u8 = 3;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<SyncError>() {
        Some(SyncError::Auth { .. }) => EXIT_AUTH,
        _ => EXIT_FATAL,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // A missing .env is fine, the variables may come from the environment.
    let _ = dotenvy::dotenv();
    let args = Cli::parse();
    init_tracing(args.json_logs);

    let cfg = match Config::resolve(args.config_path.as_deref()).and_then(|cfg| cfg.validate_ledger().map(|_| cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "failed to load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let command = args.command();
    let result = match command {
        Command::Init => init(&cfg).await,
        Command::Status => status(&cfg).await,
        Command::MarkAllSeen { max_pages } => {
            if let Err(e) = cfg.validate_remote() {
                tracing::error!(error = %e, "invalid configuration");
                return ExitCode::from(EXIT_CONFIG);
            }
            run(&cfg, SyncMode::MarkAllSeen, max_pages).await
        }
        Command::Sync { full, max_pages } => {
            if let Err(e) = cfg.validate_remote() {
                tracing::error!(error = %e, "invalid configuration");
                return ExitCode::from(EXIT_CONFIG);
            }
            let mode = if full { SyncMode::FullRescan } else { SyncMode::Incremental };
            run(&cfg, mode, max_pages).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let detail = format!("{e:#}");
            tracing::error!(error = %detail, "run failed");
            eprintln!("error: {detail}");
            ExitCode::from(exit_code(&e))
        }
    }
}

async fn open_ledger(path: &Path) -> Result<Database> {
    Database::open(path)
        .await
        .with_context(|| format!("failed to open ledger at {}", path.display()))
}

async fn init(cfg: &Config) -> Result<()> {
    let path = cfg.ledger_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let db = open_ledger(&path).await?;
    db.initialize().await.map_err(SyncError::from)?;
    println!("ledger ready at {}", path.display());
    Ok(())
}

async fn status(cfg: &Config) -> Result<()> {
    let path = cfg.ledger_path();
    let db = open_ledger(&path).await?;
    if !db.is_initialized().await.map_err(SyncError::from)? {
        return Err(SyncError::from(LedgerError::NotInitialized).into());
    }

    let count = db.count().await.map_err(SyncError::from)?;
    let watermark = db.max_watermark().await.map_err(SyncError::from)?;
    let pending = db.failures().await.map_err(SyncError::from)?;
    println!("ledger:    {}", path.display());
    println!("entries:   {count}");
    println!("pending:   {}", pending.len());
    if watermark == BEGINNING_OF_TIME {
        println!("watermark: none");
    } else {
        println!("watermark: {}", format_timestamp(&watermark));
    }
    Ok(())
}

async fn run(cfg: &Config, mode: SyncMode, max_pages: Option<u32>) -> Result<()> {
    let source = RaindropClient::new(&cfg.source, &cfg.http).map_err(SyncError::from)?;
    let sink = PocketClient::new(&cfg.sink, &cfg.http).context("failed to build pocket client")?;
    let ledger = open_ledger(&cfg.ledger_path()).await?;

    let mut settings = SyncSettings::from_config(cfg);
    if let Some(max_pages) = max_pages.filter(|n| *n > 0) {
        settings.max_pages = max_pages;
    }

    tracing::info!(
        collection = cfg.source.collection_id,
        page_size = settings.page_size,
        max_pages = settings.max_pages,
        "checking raindrop for changes"
    );
    let engine = SyncEngine::new(&source, &sink, &ledger, settings);
    let report = engine.run(mode).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    let stats = &report.stats;
    match report.mode {
        SyncMode::MarkAllSeen => {
            println!(
                "marked {} of {} bookmark(s) as seen, nothing sent to pocket",
                stats.seeded, stats.fetched
            );
        }
        SyncMode::Incremental | SyncMode::FullRescan => {
            println!(
                "forwarded {} bookmark(s) ({} new, {} updated), {} unchanged, {} failed",
                report.forwarded(),
                stats.created,
                stats.updated,
                stats.unchanged,
                report.failures.len()
            );
        }
    }

    if stats.link_conflicts > 0 {
        println!("skipped {} bookmark(s) whose link is already synced under another id", stats.link_conflicts);
    }
    for failure in &report.failures {
        println!("failed:          {} ({})", failure.link, failure.error);
    }
    for failure in &report.favorite_failures {
        println!("not favorited:   {} ({})", failure.link, failure.error);
    }
}
