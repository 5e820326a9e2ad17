//! tcplogd Server Binary
//!
//! Collects newline-delimited log lines over TCP into a rotating file.

use clap::Parser;
use std::path::PathBuf;
use tcplogd::config::{Protocol, ServerConfig};
use tcplogd::server::LogServer;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "tcplogd")]
#[command(about = "Minimal TCP log collector with a rotating file sink")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tcplogd.toml")]
    config: PathBuf,

    /// Address to bind (socket path for the unix protocol)
    #[arg(short, long)]
    address: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Transport: tcp, tcp4, tcp6 or unix
    #[arg(long)]
    protocol: Option<Protocol>,

    /// Log file to write to
    #[arg(short, long)]
    filename: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Also send logs to the systemd journal
    #[cfg(feature = "journald")]
    #[arg(long)]
    journald: bool,
}

fn init_tracing(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let default_filter = if args.verbose {
        "tcplogd=debug,info"
    } else {
        "tcplogd=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = if args.json {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    #[cfg(feature = "journald")]
    let registry = registry.with(if args.journald {
        Some(tracing_journald::layer()?)
    } else {
        None
    });

    registry.try_init()?;
    Ok(())
}

fn load_config(args: &Args) -> tcplogd::Result<ServerConfig> {
    let file = if args.config.exists() {
        Some(args.config.as_path())
    } else {
        info!(path = %args.config.display(), "Config file not found, using defaults and environment");
        None
    };

    let mut config = ServerConfig::load(file)?;

    // Override config with CLI arguments
    if let Some(address) = &args.address {
        config.listener.address = address.clone();
    }
    if let Some(port) = args.port {
        config.listener.port = port;
    }
    if let Some(protocol) = args.protocol {
        config.listener.protocol = protocol;
    }
    if let Some(filename) = &args.filename {
        config.sink.filename = filename.clone();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    init_tracing(&args)?;

    info!("Starting tcplogd v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!(
        protocol = %config.listener.protocol,
        address = %config.listener.address,
        port = config.listener.port,
        "Listener configured"
    );
    info!(
        filename = %config.sink.filename.display(),
        max_size_bytes = config.sink.max_size_bytes(),
        max_age_days = config.sink.max_age_days,
        max_backups = config.sink.max_backups,
        compress = config.sink.compress,
        "Sink configured"
    );

    let server = match LogServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "fatal error creating listener");
            std::process::exit(1);
        }
    };

    let report = server.run_until_signal().await?;
    info!(
        connections = report.connections,
        records = report.records_written,
        "tcplogd stopped"
    );
    Ok(())
}
