//! Command-line URL lookup against local threat lists
//!
//! `hashes` works offline and prints the canonical form of a URL together
//! with every lookup expression and its hash. `check` brings the local
//! database up to date and checks URLs against it. `stats` describes the
//! local database.

use clap::{Args, Parser, Subcommand};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use threatmatch::{
    ApiConfig, Config, Database, HashPrefix, HttpThreatService, MemoryDatabase, RedbDatabase,
    ThreatMatcher, Verdict,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "tmlookup")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the canonical form, lookup expressions and hashes of a URL
    Hashes {
        /// URL to hash
        url: String,
    },

    /// Update the local lists and check URLs against them
    Check(CheckArgs),

    /// Print local database statistics
    Stats {
        /// Path of the database file
        #[arg(long)]
        database: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CheckArgs {
    /// Threat service API key
    #[arg(long, env = "THREATMATCH_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Threat service base URL
    #[arg(long, default_value = threatmatch::threatmatch_api::API_BASE_URL)]
    server_url: String,

    /// HTTP proxy URL
    #[arg(long)]
    proxy: Option<String>,

    /// Path of the database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Keep lists in memory instead of on disk
    #[arg(long, conflicts_with = "database")]
    in_memory: bool,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// Client ID for API requests
    #[arg(long, default_value = env!("CARGO_PKG_NAME"))]
    client_id: String,

    /// Print statistics after checking
    #[arg(short, long)]
    stats: bool,

    /// URLs to check (if not provided, reads from stdin)
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Hashes { url } => print_hashes(&url),
        Command::Check(args) => check(args).await,
        Command::Stats { database } => {
            let database = open_database(database)?;
            println!("{}", database.stats().await);
            Ok(())
        }
    }
}

fn open_database(path: Option<PathBuf>) -> Result<RedbDatabase, Box<dyn std::error::Error>> {
    let database = match path {
        Some(path) => RedbDatabase::open(path)?,
        None => RedbDatabase::open_default()?,
    };
    info!("Using database at {}", database.path().display());
    Ok(database)
}

fn print_hashes(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let canonical = threatmatch::canonicalize(url)?;
    println!("canonical: {canonical}");
    for expression in threatmatch::candidate_lookup_strings(&canonical) {
        println!("{} {}", expression, HashPrefix::full_hash(&expression).to_base64());
    }
    Ok(())
}

async fn check(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let service = HttpThreatService::new(&ApiConfig {
        api_key: args.api_key,
        client_id: args.client_id.clone(),
        base_url: args.server_url,
        proxy_url: args.proxy,
        request_timeout: Duration::from_secs(args.timeout),
        ..Default::default()
    })?;

    let database: Arc<dyn Database> = if args.in_memory {
        Arc::new(MemoryDatabase::new())
    } else {
        Arc::new(open_database(args.database)?)
    };

    let config = Config {
        client_id: args.client_id,
        ..Default::default()
    };
    let matcher = ThreatMatcher::new(config, database, Arc::new(service))?;

    info!("Updating threat lists");
    if let Err(e) = matcher.update().await {
        // Lists that did apply are still usable
        warn!("Threat list update failed: {}", e);
    }

    if !args.urls.is_empty() {
        for url in &args.urls {
            check_url(&matcher, url).await;
        }
    } else {
        info!("Reading URLs from stdin...");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let url = match line {
                Ok(url) => url.trim().to_string(),
                Err(e) => {
                    error!("Error reading input: {}", e);
                    continue;
                }
            };

            if url.is_empty() {
                continue;
            }

            check_url(&matcher, &url).await;
        }
    }

    if args.stats {
        println!("{}", matcher.database_stats().await);
        println!("{}", matcher.cache_stats().await);
        info!("{:?}", matcher.stats().await);
    }

    Ok(())
}

async fn check_url(matcher: &ThreatMatcher, url: &str) {
    match matcher.check_url(url).await {
        Ok(Verdict::Dangerous(threat_type)) => println!("UNSAFE: {url} {threat_type}"),
        Ok(Verdict::Safe) => println!("SAFE: {url}"),
        Ok(Verdict::Unknown) => println!("UNKNOWN: {url}"),
        Err(e) => {
            error!("Error checking URL {}: {}", url, e);
            println!("ERROR: {url} ({})", e.user_message());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_lookup_expressions_are_hashed() {
        let hashes = threatmatch::threatmatch_url::hash_prefixes("http://example.com/").unwrap();
        assert_eq!(
            hashes,
            vec!["c9mG4AkGXxgsELy2pF2z1u2pSY+JMGVK8mU/ipOM2AE=".to_string()]
        );
    }
}
