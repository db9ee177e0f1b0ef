use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use edgemon::{
    clip, DiskClipWriter, MonitorConfig, MonitorCoordinator, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(name = "edgemon")]
#[command(about = "Edge-resident video monitor with presence-triggered clip recording")]
#[command(version)]
#[command(long_about = "An edge-resident video monitor that keeps a rolling buffer of recent \
frames, watches the stream with a presence detector, and persists a bounded pre/post-event \
clip whenever a confirmed presence-then-absence event occurs. Designed to run unattended \
on constrained hardware with no guaranteed camera or network continuity.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "edgemon.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the monitor")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to daily-rotated files in this directory
    #[arg(long, value_name = "DIR", help = "Directory for daily-rotated log files")]
    log_dir: Option<String>,

    /// Run for a fixed number of seconds, then shut down
    #[arg(long, value_name = "SECONDS", help = "Run duration in seconds (default: until ctrl-c)")]
    duration: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // The appender guard must outlive the runtime so buffered logs flush
    let _log_guard = init_logging(&args)?;

    info!("Starting edgemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match MonitorConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }
    config.validate().map_err(|e| {
        error!("Configuration validation failed: {}", e);
        e
    })?;

    let clip_dir = std::path::PathBuf::from(&config.recording.clip_dir);
    clip::ensure_clip_dir(&clip_dir).await?;

    let source = Box::new(SyntheticSource::new(&config.source));
    let writer = Arc::new(DiskClipWriter::new(
        clip_dir,
        config.storage.max_clips,
        config.storage.max_age_days,
    ));

    let coordinator = MonitorCoordinator::new(config, source, writer);
    coordinator.start().await.map_err(|e| {
        error!("Failed to start coordinator: {}", e);
        e
    })?;

    match args.duration {
        Some(seconds) => {
            info!("Running for {} seconds", seconds);
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupted"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
    }

    coordinator.stop().await?;

    let status = coordinator.status();
    info!(
        "Shut down cleanly: {} frames ingested, {} recordings completed, {} failed",
        status.frames_ingested, status.recordings_completed, status.recordings_failed
    );

    Ok(())
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edgemon={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    let registry = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter);

    if let Some(dir) = &args.log_dir {
        let appender = tracing_appender::rolling::daily(dir, "edgemon.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        registry
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .init();
        Ok(Some(guard))
    } else {
        registry.init();
        Ok(None)
    }
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Edgemon Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    match toml::to_string_pretty(&MonitorConfig::default()) {
        Ok(rendered) => println!("{}", rendered),
        Err(e) => eprintln!("Failed to render default configuration: {}", e),
    }
}
