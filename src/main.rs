//! `spot-enrich`: spot VM prices with eviction-risk classifications.
//!
//! ## Usage
//!
//! ```bash
//! # Spot prices for D-series v5 in two regions, classified by placement score
//! spot-enrich --region eastus --region westeurope --sku D4s_v5 --sku D8s_v5
//!
//! # Prices only, no scoring calls
//! spot-enrich --region eastus --skip-eviction --json prices.json --csv prices.csv
//!
//! # Editor schema for the config file
//! spot-enrich --print-schema > spot-enrich.schema.json
//! ```
//!
//! ## Environment Variables
//!
//! - `AZURE_SUBSCRIPTION_ID`: subscription when the config names none
//! - `AZURE_ACCESS_TOKEN`: bearer token for `credential = "env"`
//! - `LOG_FORMAT=json`: structured JSON logs on stderr
//! - `RUST_LOG=spot_enrich=debug`: log level filter

use std::path::PathBuf;

use spot_enrich::config::{self, loader, EnricherConfig};
use spot_enrich::pricing::{self, RetailPriceClient};
use spot_enrich::{init_tracing, metrics, report, Enricher};
use tracing::{info, warn};

/// Parsed CLI arguments.
#[derive(Debug, Default)]
struct Args {
    /// Config file; defaults apply when absent.
    config: Option<PathBuf>,
    /// Regions overriding `pricing.regions`.
    regions: Vec<String>,
    /// SKU substrings overriding `pricing.sku_filters`.
    skus: Vec<String>,
    /// Skip placement scoring.
    skip_eviction: bool,
    /// JSON export destination.
    json: Option<PathBuf>,
    /// CSV export destination.
    csv: Option<PathBuf>,
    /// Print the config JSON Schema and exit.
    print_schema: bool,
    /// Dump Prometheus metrics to stderr after the run.
    metrics: bool,
    /// Show usage and exit.
    help: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// # Returns
///
/// - `Ok(Args)` on success
/// - `Err(String)` with a usage message on failure
fn parse_args<I>(args: I) -> Result<Args, String>
where
    I: IntoIterator<Item = String>,
{
    let mut parsed = Args::default();
    let mut args = args.into_iter();

    fn value(flag: &str, next: Option<String>) -> Result<String, String> {
        next.filter(|v| !v.starts_with("--"))
            .ok_or_else(|| format!("{flag} requires a value"))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => parsed.config = Some(PathBuf::from(value(&arg, args.next())?)),
            "--region" | "-r" => parsed.regions.push(value(&arg, args.next())?),
            "--sku" | "-s" => parsed.skus.push(value(&arg, args.next())?),
            "--skip-eviction" => parsed.skip_eviction = true,
            "--json" => parsed.json = Some(PathBuf::from(value(&arg, args.next())?)),
            "--csv" => parsed.csv = Some(PathBuf::from(value(&arg, args.next())?)),
            "--print-schema" => parsed.print_schema = true,
            "--metrics" => parsed.metrics = true,
            "--help" | "-h" => parsed.help = true,
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
    }

    Ok(parsed)
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: spot-enrich [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   TOML config file (default: built-in defaults)",
        "  --region, -r <NAME>   Region to price; repeatable, overrides config",
        "  --sku, -s <PATTERN>   SKU substring filter; repeatable, overrides config",
        "  --skip-eviction       Do not query placement scores",
        "  --json <FILE>         Also write results as JSON",
        "  --csv <FILE>          Also write results as CSV (table columns)",
        "  --metrics             Print Prometheus metrics to stderr after the run",
        "  --print-schema        Print the config JSON Schema and exit",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

/// Load the config file (or defaults), then apply command-line overrides.
fn resolve_config(args: &Args) -> Result<EnricherConfig, config::validation::ConfigError> {
    let mut config = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None => EnricherConfig::default(),
    };
    if !args.regions.is_empty() {
        config.pricing.regions = args.regions.clone();
    }
    if !args.skus.is_empty() {
        config.pricing.sku_filters = args.skus.clone();
    }
    if args.skip_eviction {
        config.enrichment.skip = true;
    }
    loader::validate_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };

    if args.help {
        println!("{}", usage());
        return Ok(());
    }
    if args.print_schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let config = resolve_config(&args)?;
    let _ = init_tracing(&config.observability.log_format);
    metrics::init_metrics()?;

    info!(
        regions = ?config.pricing.regions,
        sku_filters = ?config.pricing.sku_filters,
        skip = config.enrichment.skip,
        "starting spot-enrich"
    );

    let prices = RetailPriceClient::from_config(&config.pricing);
    let records = prices
        .fetch_all(&config.pricing.regions, &config.pricing.sku_filters)
        .await?;
    let rows = pricing::join_records(&records);

    if rows.is_empty() {
        println!("0 results.");
        println!(
            "No spot prices matched regions {:?} and SKU filters {:?}; try adjusting --region or --sku.",
            config.pricing.regions, config.pricing.sku_filters
        );
        return Ok(());
    }

    let enricher = Enricher::from_config(&config)?;
    if let Some(shutdown) = enricher.shutdown_token() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, abandoning outstanding scoring requests");
                shutdown.cancel();
            }
        });
    }

    let result = enricher.enrich(&pricing::group_keys(&rows)).await;
    info!(keys = result.len(), sources = ?result.tier_counts(), "enrichment complete");

    let enriched = report::build_rows(&rows, &result);
    print!("{}", report::render_table(&enriched));
    println!("{} results.", enriched.len());

    if let Some(path) = &args.json {
        report::export_json(path, &enriched)?;
        info!(path = %path.display(), "JSON export written");
    }
    if let Some(path) = &args.csv {
        report::export_csv(path, &enriched)?;
        info!(path = %path.display(), "CSV export written");
    }

    if args.metrics {
        eprint!("{}", metrics::gather_metrics());
    }

    Ok(())
}
