//! Reroute Proxy - selective TLS-intercepting redirect proxy
//!
//! Standalone binary entry point. Settings come from the config file, then
//! `REROUTE_*` environment variables, then command line flags.

use anyhow::{Context, Result};
use clap::Parser;
use reroute_core::RerouteConfig;
use reroute_proxy::{run_proxy, NoopSystemProxy, OsSystemProxy, SystemProxy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "reroute-proxy", version)]
#[command(about = "Redirect selected HTTPS domains to a local gateway", long_about = None)]
struct Cli {
    /// Config file (defaults to the OS config directory)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    listen_host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    listen_port: Option<u16>,

    /// Gateway host that matching requests are sent to
    #[arg(long)]
    redirect_host: Option<String>,

    /// Gateway port
    #[arg(long)]
    redirect_port: Option<u16>,

    /// Leave the OS proxy settings alone
    #[arg(long)]
    no_system_proxy: bool,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn load_config(&self) -> Result<RerouteConfig> {
        let mut config = match &self.config {
            Some(path) => RerouteConfig::load_from(path)?,
            None => RerouteConfig::load()?,
        };
        config.apply_env()?;

        if let Some(host) = &self.listen_host {
            config.proxy.listen_host = host.clone();
        }
        if let Some(port) = self.listen_port {
            config.proxy.listen_port = port;
        }
        if let Some(host) = &self.redirect_host {
            config.redirect.host = host.clone();
        }
        if let Some(port) = self.redirect_port {
            config.redirect.port = port;
        }
        if self.no_system_proxy {
            config.proxy.configure_system_proxy = false;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Initialize logging with tracing-subscriber
fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "info,reroute_proxy=info,reroute_core=info,hudsucker=warn",
        1 => "info,reroute_proxy=debug,reroute_core=debug,hudsucker=info",
        _ => "debug,reroute_proxy=trace,reroute_core=trace,hudsucker=debug",
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    tracing::info!("Starting Reroute Proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.load_config()?;

    let system_proxy: Arc<dyn SystemProxy> = if config.proxy.configure_system_proxy {
        Arc::new(OsSystemProxy)
    } else {
        Arc::new(NoopSystemProxy)
    };

    run_proxy(config, system_proxy).await
}
