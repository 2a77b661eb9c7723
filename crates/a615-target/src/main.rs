use a615_target::audit::AuditLogger;
use a615_target::config::{
    LogFormat, LoggingConfig, TargetConfig, load_config, validate_config, write_config,
};
use a615_target::{
    Collaborators, Dispatcher, DispatcherSettings, EventKind, Result, TargetError, event_channel,
};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "a615-target", about = "ARINC 615A data-loader target")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/a615/target.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Create the load directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Directory downloaded loads are stored in
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Bind address for the maintenance TFTP listener
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Part number this target answers to
    #[arg(long)]
    part_number: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Request maintenance mode right after start-up
    #[arg(long)]
    enter_maintenance: bool,
}

fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::new(logging.level.clone());
    let (writer, guard) = match logging.file {
        Some(ref log_file) => {
            let dir = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = log_file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    TargetError::Config("logging.file must include a file name".to_string())
                })?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(file_name)
                .build(dir)
                .map_err(|e| TargetError::Config(format!("logging.file: {e}")))?;
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    match logging.format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .init(),
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        TargetConfig::default()
    };

    if let Some(root_dir) = cli.root_dir {
        config.root_dir = root_dir;
    }
    if let Some(bind_addr) = cli.bind {
        config.bind_addr = bind_addr;
    }
    if let Some(part_number) = cli.part_number {
        config.device.part_number = part_number;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        if cli.create_root_dir {
            tokio::fs::create_dir_all(&config.root_dir).await?;
        }
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.create_root_dir {
        tokio::fs::create_dir_all(&config.root_dir).await?;
    }

    if cli.check_config {
        validate_config(&config, false)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    let _log_guard = init_tracing(&config.logging)?;
    AuditLogger::set_enabled(config.logging.audit_enabled);

    let config_file = cli.config.display().to_string();
    if let Err(e) = validate_config(&config, true) {
        error!("Configuration rejected: {}", e);
        AuditLogger::configuration_error(&config_file, &e.to_string());
        return Err(e);
    }
    AuditLogger::configuration_loaded(&config_file);
    AuditLogger::target_started(
        &config.device.part_number,
        &config.bind_addr.to_string(),
        &config.root_dir.display().to_string(),
    );

    let (events, rx) = event_channel(config.queues.events, config.timeouts.event_post())?;
    let collaborators = Collaborators::host(&config, &events);
    let (dispatcher, handle) = Dispatcher::new(
        DispatcherSettings::from(&config),
        collaborators,
        events,
        rx,
    );
    let mut dispatcher_task = tokio::spawn(dispatcher.run());
    info!(
        "Target {} ready, load directory {}",
        config.device.part_number,
        config.root_dir.display()
    );

    if cli.enter_maintenance {
        handle.events().post(EventKind::EnterMaintenanceRequest).await?;
    }

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            "interrupt"
        }
        _ = &mut dispatcher_task => "dispatcher exited",
    };

    info!("Shutting down: {}", reason);
    handle.shutdown();
    if !dispatcher_task.is_finished() {
        dispatcher_task
            .await
            .map_err(|e| TargetError::Other(anyhow::anyhow!("dispatcher task failed: {e}")))?;
    }
    AuditLogger::target_shutdown(reason);
    Ok(())
}
