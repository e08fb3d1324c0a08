use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use practice_recorder::config::{Config, DEFAULT_CONFIG_FILE};
use practice_recorder::device::{DeviceAttribute, DeviceMonitor, HotplugSource, UdevadmSource};
use practice_recorder::ledger::{load_all, SessionLedger};
use practice_recorder::port::{CommandPortLister, PortResolver};
use practice_recorder::recorder::{CommandLauncher, RecordingController};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Records a practice session every time the instrument is plugged in
#[derive(Parser, Debug)]
#[command(name = "practice-recorder")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Port name to look for, overrides the config file
    #[arg(long, global = true)]
    target: Option<String>,

    /// Session ledger file, overrides the config file
    #[arg(long, global = true)]
    session_file: Option<PathBuf>,

    /// Directory for MIDI files, overrides the config file
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch for the instrument and record until interrupted (default)
    Run,
    /// List attached USB devices and whether they match the criteria
    Devices,
    /// Resolve the capture port of the target once
    Ports,
    /// Show recorded sessions
    Sessions,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn filter(self) -> String {
        let level = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        format!("practice_recorder={}", level)
    }
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)
            .with_context(|| format!("Failed to load configuration from {:?}", self.config))?;

        if let Some(target) = &self.target {
            config.target = target.clone();
        }
        if let Some(session_file) = &self.session_file {
            config.session_file = session_file.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = output_dir.clone();
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    practice_recorder::init_tracing(&cli.log_level.filter());

    match cli.command.as_ref().unwrap_or(&Commands::Run) {
        Commands::Run => run(cli.load_config()?).await,
        Commands::Devices => list_devices(cli.load_config()?).await,
        Commands::Ports => resolve_port(cli.load_config()?).await,
        Commands::Sessions => list_sessions(&cli),
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting practice-recorder v{}", env!("CARGO_PKG_VERSION"));

    let ledger = SessionLedger::open(&config.session_file)
        .with_context(|| format!("Failed to open session ledger {:?}", config.session_file))?;
    let resolver = PortResolver::new(
        CommandPortLister::new(config.enumerate_command.clone()),
        config.retry_policy(),
    );
    let launcher = CommandLauncher::new(config.capture_command.clone());
    let mut controller = RecordingController::new(
        config.target.clone(),
        config.output_dir.clone(),
        resolver,
        Box::new(launcher),
        ledger,
    )
    .with_startup_grace(config.startup_grace());

    let monitor = DeviceMonitor::new(UdevadmSource::new(), config.criteria.clone());

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    if let Err(e) = practice_recorder::service::run(monitor, &mut controller, shutdown).await {
        tracing::error!(code = e.code(), "Recorder stopped: {}", e);
        return Err(e).context("Recorder stopped with an error");
    }
    Ok(())
}

async fn list_devices(config: Config) -> Result<()> {
    let devices = UdevadmSource::new()
        .enumerate()
        .await
        .context("Failed to list USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found");
        return Ok(());
    }

    for device in &devices {
        let marker = if config.criteria.matches(device) { "*" } else { " " };
        println!(
            "{} {}:{}  {}",
            marker,
            device.get(DeviceAttribute::VendorId).unwrap_or("????"),
            device.get(DeviceAttribute::ModelId).unwrap_or("????"),
            device.label()
        );
    }
    println!();
    println!("* matches {}", config.criteria);
    Ok(())
}

async fn resolve_port(config: Config) -> Result<()> {
    let resolver = PortResolver::new(
        CommandPortLister::new(config.enumerate_command.clone()),
        config.retry_policy(),
    );
    let port = resolver
        .resolve(&config.target)
        .await
        .with_context(|| format!("Failed to resolve port for '{}'", config.target))?;
    println!("{}", port);
    Ok(())
}

fn list_sessions(cli: &Cli) -> Result<()> {
    // The ledger path may come from the flag alone, without a config file
    let session_file = match &cli.session_file {
        Some(path) => path.clone(),
        None => cli.load_config()?.session_file,
    };
    let sessions = load_all(&session_file)
        .with_context(|| format!("Failed to read session ledger {:?}", session_file))?;

    if sessions.is_empty() {
        println!("No sessions recorded yet");
        return Ok(());
    }

    let mut total = 0.0;
    for session in &sessions {
        total += session.duration_secs();
        println!(
            "{}  {:>8.1}s  {}{}",
            session.start_time().format("%Y-%m-%d %H:%M:%S"),
            session.duration_secs(),
            session.midi_file_path(),
            if session.is_degraded() { "  (incomplete)" } else { "" }
        );
    }
    println!();
    println!("{} sessions, {} total", sessions.len(), format_duration(total));
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let secs = secs.round() as u64;
    format!("{}h {:02}m {:02}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to set up SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
