//! Command-line tool for the FieldKit offline layer.
//!
//! Provides commands for:
//! - Printing the resolved precache manifest for a deployment scope
//! - Classifying URLs the way the worker would
//! - Warming a cache against a live deployment and reporting what landed
//!
//! ## Usage
//!
//! ```bash
//! # What would be precached under a GitHub Pages sub-path?
//! fieldkit-sw manifest --scope https://user.github.io/kits/
//!
//! # Which strategy serves these requests?
//! fieldkit-sw classify --origin https://user.github.io/ https://user.github.io/kits/app.js
//!
//! # Install against the live site and write a JSON report
//! fieldkit-sw warm --scope https://user.github.io/kits/ --report warm.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use fieldkit_common::{init_logging, LogConfig, LogFormat};
use fieldkit_net::{HttpFetcher, LoaderConfig, Request};
use fieldkit_sw::{
    AllowList, GenerationName, PrecacheManifest, RegistrationOptions, RequestClassifier,
    ScopeResolver, ServiceWorkerContainer, Strategy, SwResult, VersionedCacheStore, WorkerConfig,
};
use serde::Serialize;
use tracing::{error, info};
use url::Url;

#[derive(Parser)]
#[command(name = "fieldkit-sw")]
#[command(about = "Inspect and warm the FieldKit offline cache")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    /// Debug logging for the worker crates
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the precache URLs and generation names for a scope
    Manifest {
        /// Worker config (JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Registration scope URL
        #[arg(short, long)]
        scope: String,
    },

    /// Classify URLs and show the strategy each one gets
    Classify {
        /// The app's origin
        #[arg(long)]
        origin: String,
        /// Treat every URL as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Worker config (JSON) for the cross-origin allow-list
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// URLs to classify
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Install a worker against the live site and report the cache contents
    Warm {
        /// Worker config (JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Registration scope URL
        #[arg(short, long)]
        scope: String,
        /// Output JSON report path; stdout when omitted
        #[arg(short, long)]
        report: Option<PathBuf>,
        /// Per-request timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::worker_debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format))?;

    match cli.command {
        Commands::Manifest { config, scope } => {
            let config = load_config(config.as_deref())?;
            for line in manifest_lines(&config, &scope)? {
                println!("{line}");
            }
        }

        Commands::Classify {
            origin,
            navigate,
            config,
            urls,
        } => {
            let config = load_config(config.as_deref())?;
            let classifier = RequestClassifier::new(
                &Url::parse(&origin)?,
                AllowList::new(&config.cross_origin_allow_list),
            );
            for url in urls {
                println!("{}", classify_line(&classifier, &url, navigate)?);
            }
        }

        Commands::Warm {
            config,
            scope,
            report,
            timeout_ms,
        } => {
            let mut config = load_config(config.as_deref())?;
            if timeout_ms.is_some() {
                config.fetch_timeout_ms = timeout_ms;
            }
            let warm = match warm(config, &scope).await {
                Ok(warm) => warm,
                Err(e) => {
                    error!(scope = %scope, error = %e, "Warm-up failed");
                    return Err(e.into());
                }
            };

            let json = serde_json::to_string_pretty(&warm)?;
            match report {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Report written to: {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> SwResult<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::load(path),
        None => Ok(WorkerConfig::default()),
    }
}

fn manifest_lines(config: &WorkerConfig, scope: &str) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let resolver = ScopeResolver::new(&Url::parse(scope)?)?;
    let urls = PrecacheManifest::new(config.precache.iter().cloned()).resolve(&resolver)?;

    let mut lines = vec![
        format!("scope    {}", resolver.resolve_scope()),
        format!("static   {}", GenerationName::static_for(&config.version)),
        format!("runtime  {}", GenerationName::runtime_for(&config.version)),
    ];
    lines.extend(urls.into_iter().map(|url| format!("precache {url}")));
    Ok(lines)
}

fn classify_line(
    classifier: &RequestClassifier,
    url: &str,
    navigate: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let url = Url::parse(url)?;
    let request = if navigate {
        Request::navigate(url.clone())
    } else {
        Request::get(url.clone())
    };
    Ok(match classifier.classify(&request) {
        Some(class) => format!("{url}  {class:?}  {:?}", Strategy::for_class(class)),
        None => format!("{url}  Bypass"),
    })
}

/// Warm-up report.
#[derive(Debug, Serialize)]
struct WarmReport {
    version: String,
    scope: String,
    generations: Vec<GenerationReport>,
    total_bytes: u64,
}

#[derive(Debug, Serialize)]
struct GenerationReport {
    name: String,
    entries: usize,
    urls: Vec<String>,
}

async fn warm(config: WorkerConfig, scope: &str) -> Result<WarmReport, Box<dyn std::error::Error>> {
    let fetcher = HttpFetcher::new(LoaderConfig {
        default_timeout: config.fetch_timeout().or(Some(Duration::from_secs(30))),
        ..LoaderConfig::default()
    })?;
    let store = VersionedCacheStore::new();
    let (container, _events) = ServiceWorkerContainer::new(store.clone(), Arc::new(fetcher));

    let script = Url::parse(scope)?.join("sw.js")?;
    let version = config.version.clone();
    info!(scope, version = %version, "Warming cache");
    container
        .register(script.as_str(), RegistrationOptions::with_scope(scope), config)
        .await?;

    let mut generations = Vec::new();
    for name in store.generation_names().await {
        let urls = store.cached_urls(&name).await;
        generations.push(GenerationReport {
            entries: urls.len(),
            name,
            urls,
        });
    }

    Ok(WarmReport {
        version,
        scope: scope.to_string(),
        generations,
        total_bytes: store.total_bytes().await,
    })
}
