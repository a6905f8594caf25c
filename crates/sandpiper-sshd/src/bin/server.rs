//! Sandpiper SSH/SFTP daemon binary.
//!
//! Run with: cargo run --bin sandpiper-sshd -- --config-dir /etc/sandpiper

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use sandpiper_core::{MemoryDefender, MemoryUserStore, StoredUser};
use sandpiper_sshd::{Config, LogFormat, Server};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for host keys, moduli, CA keys and other relative
    /// configuration paths
    #[arg(short = 'd', long, default_value = ".")]
    config_dir: PathBuf,

    /// JSON file with the user accounts served by the in-memory store
    #[arg(short, long)]
    users: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    /// Log format (json or text)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Log file path
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if args.verbose {
        config.logging.level = "debug".to_string();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    if let Some(file) = args.log_file {
        config.logging.file = Some(file);
    }

    let _log_guard = init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_dir = %args.config_dir.display(),
        "starting sandpiper sshd"
    );

    let store = Arc::new(MemoryUserStore::new());
    match &args.users {
        Some(path) => match load_users(path) {
            Ok(users) => {
                info!(count = users.len(), "users loaded");
                for user in users {
                    store.add_user(user);
                }
            }
            Err(e) => {
                error!(error = %e, "failed to load users file");
                std::process::exit(1);
            }
        },
        None => {
            warn!("no users file configured, every login will fail");
        }
    }

    let server = Server::new(
        config,
        args.config_dir,
        store,
        Arc::new(MemoryDefender::default()),
    );
    if let Err(e) = server.run().await {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}

fn load_users(path: &PathBuf) -> Result<Vec<StoredUser>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&content).map_err(|e| e.to_string())
}

fn init_logging(config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    if let Some(log_file) = &config.logging.file {
        let directory = log_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        if let Err(e) = std::fs::create_dir_all(directory) {
            eprintln!("unable to create log directory: {e}, logging to stderr");
        } else {
            let file_name = log_file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "sandpiper-sshd.log".to_string());
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            match config.logging.format {
                LogFormat::Json => {
                    tracing_subscriber::fmt()
                        .json()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .init();
                }
                LogFormat::Text => {
                    tracing_subscriber::fmt()
                        .with_env_filter(filter)
                        .with_writer(writer)
                        .init();
                }
            }
            return Some(guard);
        }
    }

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    None
}
