use anyhow::{Context, Result};
use clap::Parser;
use hyacine_proxy::ca::CA_CERT_FILE;
use hyacine_proxy::{CaState, RuleConfig, RuleSet, Service};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Intercepting proxy that redirects game client traffic to local servers.
///
/// Hosts on the redirect list are decrypted with certificates from a local
/// CA. Install the generated CA certificate as trusted on the client.
#[derive(Parser, Debug)]
#[command(name = "hyacine-proxy")]
#[command(version, about)]
struct Args {
    /// Path to the rule configuration file (YAML or JSON).
    /// Created with default rules if it does not exist.
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory holding the CA key and certificate.
    #[arg(long, default_value = ".")]
    ca_dir: PathBuf,

    /// Address to listen on. The port comes from the configuration.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = Args::parse();

    let config = RuleConfig::load_or_create(&args.config)
        .with_context(|| format!("failed to load config from {:?}", args.config))?;
    let rules = RuleSet::from_config(&config)
        .with_context(|| format!("invalid config in {:?}", args.config))?;

    if args.check {
        println!("{}: ok", args.config.display());
        println!("  proxy port:     {}", rules.proxy_port());
        println!("  dispatch:       {}", rules.dispatch().endpoint());
        println!("  sdk:            {}", rules.sdk().endpoint());
        println!("  block paths:    {}", rules.block_paths().len());
        return Ok(());
    }

    let ca = CaState::load_or_generate(&args.ca_dir)
        .with_context(|| format!("failed to set up CA in {:?}", args.ca_dir))?;
    info!(
        "CA certificate: {}",
        args.ca_dir.join(CA_CERT_FILE).display()
    );

    Service::new(rules, ca)
        .with_config_path(args.config)
        .with_bind_addr(args.bind)
        .run()
        .await
}
