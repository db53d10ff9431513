//! Sift - a multi-threaded deep packet inspection and filtering engine
//!
//! This is the command line entry point: it loads configuration, applies
//! block rules from the command line, runs the engine over the input
//! capture, and prints the run report.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{info, warn, Level};

use sift::config::SiftConfig;
use sift::core::SiftEngine;
use sift::protocols::AppType;
use sift::utils::logger;
use sift::utils::parse_ipv4;

/// Command line arguments for Sift
#[derive(Parser, Debug)]
#[clap(
    author = "Sift Team",
    version,
    about = "A multi-threaded deep packet inspection and filtering engine"
)]
struct Args {
    /// Input capture file
    input: String,

    /// Output capture file for forwarded packets
    output: String,

    /// Path to the configuration file
    #[clap(short, long)]
    config: Option<String>,

    /// Block a source IP (dotted quad, repeatable)
    #[clap(long = "block-ip", value_name = "IP")]
    block_ips: Vec<String>,

    /// Block an application by name (repeatable)
    #[clap(long = "block-app", value_name = "APP")]
    block_apps: Vec<String>,

    /// Block a domain by substring or *.wildcard (repeatable)
    #[clap(long = "block-domain", value_name = "DOMAIN")]
    block_domains: Vec<String>,

    /// Load block rules from a rule file
    #[clap(long = "rules", value_name = "FILE")]
    rules_file: Option<String>,

    /// Only exact domain matches block
    #[clap(long = "strict-domains")]
    strict_domains: bool,

    /// Number of load balancer threads
    #[clap(long, value_name = "N")]
    lbs: Option<usize>,

    /// Fast-path worker threads per load balancer
    #[clap(long, value_name = "N")]
    fps: Option<usize>,

    /// Write run statistics as JSON to this path
    #[clap(long, value_name = "PATH")]
    json: Option<String>,

    /// Verbose output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let verbosity_level: Level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // Load configuration
    let mut config: SiftConfig = match &args.config {
        Some(path) if Path::new(path).exists() => SiftConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path))?,
        Some(path) => bail!("configuration file not found: {}", path),
        None => SiftConfig::default(),
    };

    // Override configuration with command line arguments
    if let Some(lbs) = args.lbs {
        config.pipeline.load_balancers = lbs;
    }
    if let Some(fps) = args.fps {
        config.pipeline.fps_per_lb = fps;
    }
    if args.strict_domains {
        config.rules.strict_domain_matching = true;
    }
    if let Some(rules_file) = &args.rules_file {
        config.rules.rules_file = Some(rules_file.clone());
    }

    let log_level: Level = config
        .logging
        .log_level
        .parse::<Level>()
        .unwrap_or(verbosity_level);
    logger::init_logging(
        if args.verbose > 0 { verbosity_level } else { log_level },
        config.logging.log_file.as_deref(),
    );

    config.validate().context("invalid configuration")?;

    info!("Starting Sift");
    let engine = SiftEngine::new(config);

    // Apply command line block rules
    let rules = engine.rules();
    for ip in &args.block_ips {
        match parse_ipv4(ip) {
            Some(ip) => rules.block_ip(ip),
            None => bail!("invalid --block-ip value: {}", ip),
        }
    }
    for app in &args.block_apps {
        match AppType::from_app_name(app) {
            Some(app) => rules.block_app(app),
            None => bail!("unknown --block-app value: {}", app),
        }
    }
    for domain in &args.block_domains {
        rules.block_domain(domain);
    }

    // Stop the reader early on ctrl-c; the pipeline drains and the report
    // still covers everything processed so far.
    let stop = engine.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || {
        stop.store(true, std::sync::atomic::Ordering::SeqCst);
    }) {
        warn!("Could not install ctrl-c handler: {}", e);
    }

    let report = engine.process_file(&args.input, &args.output)?;

    println!("{}", report);

    if let Some(json_path) = &args.json {
        report
            .to_stats_report()
            .write_json(json_path)
            .with_context(|| format!("failed to write JSON stats to {}", json_path))?;
        info!("Wrote JSON stats to {}", json_path);
    }

    info!("Output written to {}", args.output);
    Ok(())
}
