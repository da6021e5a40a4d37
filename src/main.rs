use anyhow::Result;
use clap::Parser;
use pilapse::{CameraManager, MetricsLogger, PilapseConfig, Scheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pilapse")]
#[command(about = "Raspberry Pi timelapse capture controller")]
#[command(version)]
#[command(long_about = "Drives a camera on a fixed schedule with timing-drift \
correction, evaluates per-frame image quality, and appends a row per capture to \
an append-only CSV metadata log. Designed for long unattended runs on a \
Raspberry Pi; shuts down cleanly on SIGINT/SIGTERM.")]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "pilapse.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Capture interval in seconds (overrides config)
    #[arg(short, long, help = "Capture interval in seconds")]
    interval: Option<u32>,

    /// Duration to run in hours (overrides config, 0 = indefinite)
    #[arg(short, long, help = "Duration to run in hours (0 = indefinite)")]
    duration: Option<f64>,

    /// Output directory for images (overrides config)
    #[arg(short, long, help = "Output directory for captured images")]
    output_dir: Option<String>,

    /// Enable debug logging (most verbose)
    #[arg(long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Rehearse the schedule without capturing images
    #[arg(long, help = "Exercise timing and display logic without touching the camera output")]
    dry_run: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting a run")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Load configuration and apply CLI overrides before logging starts so
    // config problems report cleanly to stderr.
    let mut config = match PilapseConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = apply_overrides(&mut config, &args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let validation_errors = config.get_validation_errors();

    if args.validate_config {
        if validation_errors.is_empty() {
            println!("✓ Configuration is valid");
            return Ok(());
        }
        eprintln!("✗ Configuration validation failed:");
        for (i, err) in validation_errors.iter().enumerate() {
            eprintln!("  {}. {}", i + 1, err);
        }
        std::process::exit(1);
    }

    if !validation_errors.is_empty() {
        eprintln!("Error: invalid configuration in {}:", args.config);
        for (i, err) in validation_errors.iter().enumerate() {
            eprintln!("  {}. {}", i + 1, err);
        }
        eprintln!("Fix these values, or run with --validate-config to re-check.");
        std::process::exit(1);
    }

    // Directories must exist before the rolling file appender opens
    if let Err(e) = pilapse::storage::ensure_directories(&config) {
        eprintln!("Error: {}", e);
        eprintln!("Check directory permissions and free disk space before retrying.");
        std::process::exit(1);
    }

    let _log_guard = init_logging(&args, &config)?;

    info!("Starting pilapse v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let metrics = match MetricsLogger::new(&config.logging.log_dir, &config.logging.csv_filename) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to initialize metrics logger: {}", e);
            eprintln!("Error: failed to initialize metrics logger: {}", e);
            eprintln!(
                "If the CSV schema changed, move the old file aside: {}/{}",
                config.logging.log_dir, config.logging.csv_filename
            );
            std::process::exit(1);
        }
    };

    // Camera initialization blocks on the driver; keep it off the runtime
    let device_index = config.camera.device_index;
    let mut camera = CameraManager::new(config.camera.clone());
    let (camera, init_result) = tokio::task::spawn_blocking(move || {
        let result = camera.initialize();
        (camera, result)
    })
    .await?;

    if let Err(e) = init_result {
        error!("Failed to initialize camera: {}", e);
        eprintln!("Error: failed to initialize camera: {}", e);
        eprintln!(
            "Check that the camera is connected and /dev/video{} is accessible.",
            device_index
        );
        std::process::exit(1);
    }

    let mut scheduler = Scheduler::new(config, camera, metrics, args.verbose, args.dry_run)?;
    setup_signal_handlers(scheduler.cancellation_token());

    match scheduler.run().await {
        Ok(outcome) => {
            info!(
                "Run complete: {} captures attempted, {} failed cycles",
                outcome.captures_attempted, outcome.failed_cycles
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("\nFatal error: {}", e);
            std::process::exit(1);
        }
    }
}

fn apply_overrides(config: &mut PilapseConfig, args: &Args) -> Result<()> {
    if let Some(interval) = args.interval {
        config.set_interval_seconds(interval)?;
    }
    if let Some(duration) = args.duration {
        config.set_duration_hours(duration)?;
    }
    if let Some(output_dir) = &args.output_dir {
        config.set_output_dir(output_dir)?;
    }
    if args.verbose {
        config.set_log_level("debug")?;
    }
    Ok(())
}

fn init_logging(
    args: &Args,
    config: &PilapseConfig,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        config.logging.log_level.as_str()
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pilapse={}", log_level)));

    // Rolling file log next to the CSV, survives console redirection
    let file_appender = tracing_appender::rolling::daily(&config.logging.log_dir, "pilapse.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);

    let console_layer = match args.log_format.as_deref() {
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
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: unknown log format '{}', using default", format);
            fmt::layer().boxed()
        }
        None => fmt::layer()
            .with_target(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn setup_signal_handlers(cancel: CancellationToken) {
    // SIGTERM (systemd stop) - Unix only
    #[cfg(unix)]
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to register SIGTERM handler");
            if sigterm.recv().await.is_some() {
                println!("\nReceived SIGTERM. Initiating graceful shutdown...");
                info!("Received SIGTERM, initiating graceful shutdown");
                cancel.cancel();
            }
        });
    }

    // SIGINT (Ctrl+C) - cross-platform
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nReceived SIGINT. Initiating graceful shutdown...");
            info!("Received SIGINT, initiating graceful shutdown");
            cancel.cancel();
        }
    });
}

/// Print the default configuration in TOML format
fn print_default_config() -> Result<()> {
    let default_config = PilapseConfig::default();
    let toml = toml::to_string_pretty(&default_config)
        .map_err(|e| anyhow::anyhow!("failed to serialize default configuration: {}", e))?;

    println!("# Pilapse configuration file");
    println!("# All values shown are the built-in defaults");
    println!();
    println!("{}", toml);
    Ok(())
}
