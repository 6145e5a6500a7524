//! Tunnel Pilot - CLI Entry Point
//!
//! Loads settings (file, environment, flags), then either runs a single
//! evaluation (`--evaluate-only`) or supervises the best tunnel until SIGINT
//! or SIGTERM.

// Use mimalloc as global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunnel_pilot::{Pilot, RunOptions, Settings, VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tunnel-pilot")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Adaptive selection and supervision of proxy tunnel configurations")]
struct Args {
    /// Path to a YAML settings file
    #[arg(short = 's', long = "settings")]
    settings: Option<PathBuf>,

    /// Candidate configuration directory (overrides CONFIG_DIR)
    #[arg(short = 'd', long = "dir")]
    dir: Option<PathBuf>,

    /// Tunnel binary (overrides TUNNEL_BINARY)
    #[arg(short = 'b', long = "binary")]
    binary: Option<PathBuf>,

    /// Re-evaluation interval in seconds (overrides TEST_INTERVAL)
    #[arg(short = 'i', long = "interval")]
    interval: Option<u64>,

    /// Start this candidate without an initial evaluation
    #[arg(short = 'c', long = "initial")]
    initial: Option<String>,

    /// Run one evaluation, print the best candidate id and exit
    #[arg(short = 't', long = "evaluate-only")]
    evaluate_only: bool,

    /// Serve the status API on this address
    #[arg(long = "status-listen")]
    status_listen: Option<SocketAddr>,

    /// Log level used when RUST_LOG is unset
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("pilot-worker")
        .build()?;

    let code = runtime.block_on(async_main(args))?;
    drop(runtime);
    std::process::exit(code);
}

async fn async_main(args: Args) -> anyhow::Result<i32> {
    let mut settings = match &args.settings {
        Some(path) => Settings::load(path).await?,
        None => Settings::default(),
    };
    settings.apply_env()?;
    apply_args(&mut settings, &args);

    init_logging(&settings.log_level, args.log_format)?;
    info!("Tunnel Pilot v{}", VERSION);

    let pilot = match Pilot::new(settings).await {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return Ok(1);
        }
    };

    // Evaluate-only mode
    if args.evaluate_only {
        let evaluation = pilot.evaluate().await;
        return Ok(match evaluation.winner() {
            Ok(best) => {
                println!("{}", best.id());
                0
            }
            Err(e) => {
                error!("{}", e);
                1
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let options = RunOptions {
        initial: args.initial.clone(),
        status_listen: args.status_listen,
    };
    if let Err(e) = pilot.run(options, shutdown).await {
        error!("Fatal: {}", e);
        return Ok(1);
    }

    info!("Tunnel Pilot stopped");
    Ok(0)
}

/// CLI flags win over the settings file and the environment
fn apply_args(settings: &mut Settings, args: &Args) {
    if let Some(dir) = &args.dir {
        settings.config_dir = dir.clone();
    }
    if let Some(binary) = &args.binary {
        settings.binary = binary.clone();
    }
    if let Some(interval) = args.interval {
        settings.controller.interval_secs = interval;
    }
    if let Some(level) = &args.log_level {
        settings.log_level = level.clone();
    }
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(format!("tunnel_pilot={},tower_http=info", level)),
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init()?,
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
    }
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn watch_signals(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = term.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
    }

    shutdown.cancel();
}
