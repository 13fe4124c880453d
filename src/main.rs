//! medcache - command line front end for the portal data layer
//!
//! Issues cached reads against the hosted backend:
//! - `--repeat` re-runs the same call to show cache hits
//! - `--metrics` prints the Prometheus exposition on exit
//! - `health` reports the backend breaker state

use anyhow::Context;
use clap::{Parser, Subcommand};
use medcache::cache::{spawn_janitor, CacheService, CircuitBreaker, Sourced};
use medcache::config::Config;
use medcache::metrics::create_metrics;
use medcache::model::{ContentKind, ListOptions};
use medcache::services::{HttpBackend, Portal};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// medcache - cached access to the medical portal backend
#[derive(Parser, Debug)]
#[command(name = "medcache")]
#[command(author, version, about = "Medical portal data layer", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long)]
    json_logs: bool,

    /// Enable debug logging for backend API requests
    #[arg(long)]
    debug_requests: bool,

    /// Issue the same call this many times
    #[arg(long, default_value_t = 1)]
    repeat: u32,

    /// Print Prometheus metrics before exiting
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List diseases for a language, or show one by id
    Diseases {
        #[arg(long, default_value = "uz")]
        lang: String,
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// Serve an empty catalogue instead of failing when the backend is down
        #[arg(long)]
        offline: bool,
    },
    /// Show a question page with its answers
    Question { slug: String },
    /// List verified doctors, or show one by id
    Doctors {
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        specialty: Option<String>,
    },
    /// List news, articles or videos, or show one by slug
    Content {
        kind: ContentKind,
        #[arg(long, default_value = "uz")]
        lang: String,
        #[arg(long)]
        slug: Option<String>,
        /// Serve a notice instead of failing when the backend is down
        #[arg(long)]
        offline: bool,
    },
    /// Probe the backend and report breaker state
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file first (before parsing args, so env vars are available)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level, args.json_logs, args.debug_requests)?;

    info!("Starting medcache v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env().context("Failed to load configuration")?;
    config.debug_requests = args.debug_requests;

    if args.debug_requests {
        info!("Request debugging enabled");
    }

    let metrics = create_metrics();
    let breaker = Arc::new(CircuitBreaker::new(config.health.cooldown).with_metrics(metrics.clone()));
    let cache = Arc::new(CacheService::new(breaker.clone()).with_metrics(metrics.clone()));
    let backend = Arc::new(HttpBackend::new(&config.backend, breaker).with_metrics(metrics.clone()));
    let portal = Portal::new(backend, cache.clone(), &config.cache);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let janitor = spawn_janitor(cache.clone(), config.cache.sweep_interval, shutdown_rx);

    let mut outcome = Ok(());
    for round in 1..=args.repeat.max(1) {
        let start = Instant::now();
        let result = run_command(&portal, &cache, &args.command).await;
        let stats = cache.stats();
        info!(
            round = round,
            elapsed_ms = start.elapsed().as_millis() as u64,
            entries = stats.entries,
            health = stats.health.as_str(),
            "Call complete"
        );

        match result {
            Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
            Err(e) => {
                warn!(error = %e, round = round, "Call failed");
                outcome = Err(e);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = janitor.await {
        warn!(error = %e, "Cache janitor did not stop cleanly");
    }

    if args.metrics {
        print!("{}", metrics.render());
    }

    info!("medcache finished");
    outcome
}

async fn run_command(portal: &Portal, cache: &CacheService, command: &Command) -> anyhow::Result<Value> {
    let value = match command {
        Command::Diseases { id: Some(id), .. } => to_json(portal.diseases.get(*id).await?.as_ref())?,
        Command::Diseases {
            lang,
            id: None,
            category,
            limit,
            offline,
        } => {
            let opts = ListOptions {
                category: category.clone(),
                limit: *limit,
                offset: None,
            };
            if *offline {
                sourced_json(portal.diseases.list_or_offline(lang, opts).await?)?
            } else {
                to_json(portal.diseases.list(lang, opts).await?.as_ref())?
            }
        }
        Command::Question { slug } => to_json(portal.questions.get_by_slug(slug).await?.as_ref())?,
        Command::Doctors { id: Some(id), .. } => to_json(portal.doctors.get(id).await?.as_ref())?,
        Command::Doctors { id: None, specialty } => {
            let opts = ListOptions {
                category: specialty.clone(),
                ..Default::default()
            };
            to_json(portal.doctors.list(opts).await?.as_ref())?
        }
        Command::Content {
            kind,
            slug: Some(slug),
            ..
        } => to_json(portal.content.get_by_slug(*kind, slug).await?.as_ref())?,
        Command::Content {
            kind,
            lang,
            slug: None,
            offline,
        } => {
            if *offline {
                sourced_json(
                    portal
                        .content
                        .list_or_offline(*kind, lang, ListOptions::default())
                        .await?,
                )?
            } else {
                to_json(
                    portal
                        .content
                        .list(*kind, lang, ListOptions::default())
                        .await?
                        .as_ref(),
                )?
            }
        }
        Command::Health => {
            let probe = portal.diseases.list("uz", ListOptions::page(1, 0)).await;
            let stats = cache.stats();
            let breaker = cache.breaker();
            json!({
                "status": stats.health.as_str(),
                "probe": match &probe {
                    Ok(_) => "ok".to_string(),
                    Err(e) => e.to_string(),
                },
                "cache_entries": stats.entries,
                "in_flight": stats.in_flight,
                "cooldown_seconds": breaker.cooldown().as_secs(),
                "last_tripped_seconds_ago": breaker
                    .last_tripped_at()
                    .map(|at| at.elapsed().as_secs()),
                "version": env!("CARGO_PKG_VERSION"),
            })
        }
    };
    Ok(value)
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<Value> {
    serde_json::to_value(value).context("Failed to serialize response")
}

fn sourced_json<T: Serialize>(sourced: Sourced<T>) -> anyhow::Result<Value> {
    Ok(json!({
        "source": if sourced.is_fallback() { "offline" } else { "live" },
        "data": to_json(sourced.value.as_ref())?,
    }))
}

fn init_logging(level: &str, json: bool, debug_requests: bool) -> anyhow::Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // Build filter: set medcache to requested level, and optionally enable request debugging
    let filter = if debug_requests {
        EnvFilter::new(format!(
            "medcache={},medcache::services::backend=debug,reqwest=debug,hyper=warn",
            level
        ))
    } else {
        EnvFilter::new(format!("medcache={},hyper=warn", level))
    };

    // stdout carries command output, logs go to stderr
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }

    Ok(())
}
