use std::env;
use std::path::PathBuf;

use clap::{Args, Parser};
use thiserror::Error;
use tracing::debug;

use undertow::config::{Config, DEFAULT_AUTHORITY_MODULE, ServiceId, Target, services};
use undertow::descriptor::ExtensionBundle;
use undertow::pipeline::{Pipeline, PipelineError};
use undertow::telemetry::logging::{self as logctl, LogConfig, LogLevel};

fn main() {
    if let Err(err) = run() {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.into_config()?;
    let pipeline = Pipeline::new(config)?;
    let report = pipeline.run().await?;

    println!(
        "✅ Complete: {} extracted, {} skipped",
        report.extracted, report.skipped
    );
    Ok(())
}

#[derive(Debug, Error)]
enum CliError {
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error("invalid target `{spec}`: {reason}")]
    Target { spec: String, reason: String },
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

#[derive(Parser, Debug)]
#[command(
    name = "undertow",
    about = "Siphon protected files through brokered capability tokens",
    version
)]
struct Cli {
    #[arg(
        long,
        env = "UNDERTOW_SOCKET_DIR",
        default_value = "/var/run",
        help = "Directory holding the coordinator service sockets"
    )]
    socket_dir: PathBuf,

    #[arg(
        long,
        env = "UNDERTOW_SCRATCH_DIR",
        help = "Scratch directory for disposable descriptors [default: $TMPDIR/undertow]"
    )]
    scratch_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "UNDERTOW_CACHE_DIR",
        help = "Transfer service cache directory [default: derived from the user temp dir]"
    )]
    cache_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "UNDERTOW_AUTHORITY_MODULE",
        default_value = DEFAULT_AUTHORITY_MODULE,
        help = "Path of the local authorization module"
    )]
    authority_module: PathBuf,

    #[arg(
        long = "tcim",
        help = "Present the TCIM extension-bundle identity instead of Korean"
    )]
    use_tcim: bool,

    #[command(flatten)]
    logging: LoggingArgs,

    #[arg(
        value_name = "TARGET",
        help = "Target files as PATH[=chat|nicknames] [default: the user's message store]"
    )]
    targets: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "UNDERTOW_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "UNDERTOW_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    fn into_config(self) -> Result<Config, CliError> {
        let targets = if self.targets.is_empty() {
            let home = env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/"));
            Config::default_targets(&home)
        } else {
            self.targets
                .iter()
                .map(|spec| {
                    Target::parse(spec).map_err(|reason| CliError::Target {
                        spec: spec.clone(),
                        reason,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let extension_bundle = if self.use_tcim {
            ExtensionBundle::tcim()
        } else {
            ExtensionBundle::korean()
        };

        Ok(Config {
            socket_dir: self.socket_dir,
            scratch_dir: self
                .scratch_dir
                .unwrap_or_else(|| env::temp_dir().join("undertow")),
            transfer_cache_dir: self
                .cache_dir
                .unwrap_or_else(Config::default_transfer_cache_dir),
            authority_module: self.authority_module,
            launch_broker: ServiceId::new(services::LAUNCH_BROKER),
            resource_coordinator: ServiceId::new(services::RESOURCE_COORDINATOR),
            transfer_service: ServiceId::new(services::TRANSFER_SERVICE),
            extension_bundle,
            targets,
        })
    }
}
