use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{LogConfig, LogFormat, StoreBackend, StoreConfig, WardenConfig};
use ratewarden::ratelimit::{RateLimiter, RequestDescriptor, RuleResolver, Verdict};
use ratewarden::store::{CounterStore, InMemoryCounterStore, RedisCounterStore};

/// Exit code for a request that was rate limited.
const EXIT_LIMITED: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Fixed-window rate limit decisions")]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate one request's descriptors against the counter store
    Check {
        /// Descriptor such as `account=u1,ip=10.0.0.1,type=login`; repeatable
        #[arg(short, long = "descriptor", required = true, value_parser = parse_descriptor)]
        descriptors: Vec<RequestDescriptor>,

        /// Evaluate the same request this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// Print verdicts as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show which rule applies to a descriptor
    Resolve {
        #[arg(value_parser = parse_descriptor)]
        descriptor: RequestDescriptor,
    },
    /// List the configured rules in resolution priority order
    Rules,
}

fn parse_descriptor(s: &str) -> Result<RequestDescriptor, String> {
    s.parse().map_err(|e: ratewarden::error::WardenError| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = WardenConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.log);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let rules = Arc::new(config.rule_set().context("loading rate limit rules")?);
    info!(rules = rules.len(), "Rules loaded");

    match cli.command {
        Command::Rules => {
            for (index, rule) in rules.by_priority() {
                println!("#{:<3} {}", index, serde_json::to_string(rule)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Resolve { descriptor } => {
            let resolver = RuleResolver::new(rules);
            match resolver.resolve_indexed(&descriptor) {
                Some((index, rule)) => println!("{} -> #{} {}", descriptor, index, rule),
                None => println!("{} -> no rule applies", descriptor),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            descriptors,
            repeat,
            json,
        } => {
            let store = connect_store(&config.store).await?;
            let limiter = RateLimiter::new(rules, store, &config.limiter);

            tokio::select! {
                result = run_checks(&limiter, &descriptors, repeat, json) => result,
                _ = shutdown_signal() => Ok(ExitCode::FAILURE),
            }
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match log.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Memory => {
            let store = Arc::new(InMemoryCounterStore::new());
            let _janitor = store.spawn_janitor(config.janitor_interval());
            info!("Using in-memory counter store");
            Ok(store as Arc<dyn CounterStore>)
        }
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(&config.redis_url, config.connect_timeout())
                .await
                .context("connecting to Redis")?;
            Ok(Arc::new(store))
        }
    }
}

async fn run_checks(
    limiter: &RateLimiter,
    descriptors: &[RequestDescriptor],
    repeat: u32,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut last: Option<Verdict> = None;

    for attempt in 1..=repeat.max(1) {
        let verdict = match limiter.evaluate(descriptors).await {
            Ok(verdict) => verdict,
            Err(e) if e.is_store_unavailable() => {
                warn!(error = %e, "Counter store unavailable, no decision made");
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        if json {
            println!("{}", serde_json::to_string(&verdict)?);
        } else {
            print_verdict(attempt, &verdict);
        }
        last = Some(verdict);
    }

    let limited = last.map(|v| v.should_limit()).unwrap_or(false);
    Ok(if limited {
        ExitCode::from(EXIT_LIMITED)
    } else {
        ExitCode::SUCCESS
    })
}

fn print_verdict(attempt: u32, verdict: &Verdict) {
    let decision = if verdict.should_limit() { "DENY" } else { "ADMIT" };
    println!("[{}] {}", attempt, decision);

    for status in &verdict.statuses {
        match (&status.rule, &status.window) {
            (Some(matched), Some(window)) => println!(
                "    {} -> #{} {} ({}/{}, resets in {}s)",
                status.descriptor,
                matched.index,
                matched.rule,
                window.count,
                window.limit,
                window.reset_after.as_secs()
            ),
            _ => println!("    {} -> no rule applies", status.descriptor),
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
