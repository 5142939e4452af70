//! WLFW - Whitelist Firewall
//!
//! An HTTP service that keeps a whitelist of iptables ACCEPT rules for TCP ports.
//!
//! # Features
//!
//! - Add, list and remove `(destPort, sourceIPRange)` entries over HTTP
//! - New rules go to the top of `filter/INPUT`
//! - Self-heals registry entries whose kernel rule was removed by someone else
//! - Optional adoption of existing ACCEPT rules at startup
//! - Audit logging for every kernel mutation
//!
//! # Usage
//!
//! ```bash
//! # Run the service (default command)
//! wlfw
//! wlfw serve --listen 127.0.0.1:8080 -v
//!
//! # Serve against an in-memory rule table, no iptables needed
//! wlfw serve --dry-run
//!
//! # CLI commands
//! wlfw rules                 # Show whitelist-shaped rules in filter/INPUT
//! wlfw init-config           # Write the default config file
//! wlfw init-config --force   # Overwrite an existing config file
//! ```

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::Level;
use wlfw::api::{AppState, serve, shutdown_signal};
use wlfw::audit::AuditLog;
use wlfw::config::{self, ServiceConfig};
use wlfw::core::accept::{CHAIN, TABLE, parse_rule_spec};
use wlfw::core::gateway::{Firewall, IptablesFirewall};
use wlfw::core::memory::MemoryFirewall;
use wlfw::{Error, Reconciler};

#[derive(Parser)]
#[command(name = "wlfw")]
#[command(about = "Whitelist Firewall - HTTP-managed iptables ACCEPT rules", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: <config dir>/config.json)
    #[arg(short, long, global = true, value_name = "PATH", env = "WLFW_CONFIG")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write logs to <state dir>/wlfw.log instead of stderr
    #[arg(long, global = true)]
    log_file: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(short, long, value_name = "ADDR")]
        listen: Option<SocketAddr>,
        /// Keep rules in memory instead of calling iptables
        #[arg(long)]
        dry_run: bool,
    },
    /// Show whitelist-shaped rules currently in filter/INPUT
    Rules,
    /// Write the default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = wlfw::utils::ensure_dirs() {
        eprintln!("Warning: could not create state directories: {e}");
    }
    init_logging(cli.verbose, cli.log_file);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config_path = cli.config.or_else(config::default_config_path);
    let command = cli.command.unwrap_or(Commands::Serve {
        listen: None,
        dry_run: false,
    });

    match runtime.block_on(handle_cli(command, config_path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, log_file: bool) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    if log_file && let Some(mut log_path) = wlfw::utils::get_state_dir() {
        log_path.push("wlfw.log");
        if let Ok(file) = std::fs::File::create(log_path) {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt().with_max_level(level).init();
}

async fn load(config_path: Option<&Path>) -> Result<ServiceConfig, Error> {
    match config_path {
        Some(path) => config::load_config(path).await,
        None => Ok(ServiceConfig::default()),
    }
}

async fn handle_cli(command: Commands, config_path: Option<PathBuf>) -> Result<(), Error> {
    match command {
        Commands::Serve { listen, dry_run } => {
            let mut config = load(config_path.as_deref()).await?;
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }
            run_server(&config, dry_run).await?;
        }
        Commands::Rules => {
            let config = load(config_path.as_deref()).await?;
            let firewall = IptablesFirewall::new(config.iptables_options());
            let lines = firewall.list(TABLE, CHAIN).await?;
            println!("Whitelist rules in {TABLE}/{CHAIN}:");
            let mut found = 0;
            for accept in lines.iter().filter_map(|line| parse_rule_spec(line, CHAIN)) {
                let source = if accept.source_ip_range.is_empty() {
                    "any"
                } else {
                    accept.source_ip_range.as_str()
                };
                println!("  tcp/{:<5} from {source}", accept.dest_port);
                found += 1;
            }
            if found == 0 {
                println!("  (none)");
            }
        }
        Commands::InitConfig { force } => {
            let path = config_path
                .ok_or_else(|| Error::Config("Could not determine config directory".into()))?;
            if path.exists() && !force {
                return Err(Error::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            config::save_config(&ServiceConfig::default(), &path)?;
            println!("✓ Wrote {}", path.display());
        }
    }
    Ok(())
}

async fn run_server(config: &ServiceConfig, dry_run: bool) -> Result<(), Error> {
    let firewall: Arc<dyn Firewall> = if dry_run {
        tracing::warn!("Dry run: rules are kept in memory, iptables is not called");
        Arc::new(MemoryFirewall::new())
    } else {
        Arc::new(IptablesFirewall::new(config.iptables_options()))
    };

    let mut reconciler = Reconciler::new(firewall).with_options(config.reconciler_options());
    if config.audit_enabled {
        match AuditLog::new() {
            Ok(audit) => {
                tracing::info!("Audit log: {}", audit.path().display());
                reconciler = reconciler.with_audit(audit);
            }
            Err(e) => tracing::warn!("Audit log disabled: {e}"),
        }
    }

    if config.sync_on_startup {
        reconciler.adopt_existing_rules().await?;
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    let state = Arc::new(AppState::new(Arc::new(reconciler)));
    serve(listener, state, shutdown_signal()).await?;
    Ok(())
}
