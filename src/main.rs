//! registry-proxy - Main entry point
//!
//! Fronts the Terraform registry and release downloads behind operator hostnames

use anyhow::{Context, Result};
use clap::Parser;
use registry_proxy::config::{DEFAULT_MAX_BODY_BYTES, DEFAULT_TERRAFORM_VERSION};
use registry_proxy::{HttpsUpstream, ProxyConfiguration, ProxyEngine, ProxyServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// registry-proxy - A rewriting reverse proxy for the Terraform registry
#[derive(Parser, Debug)]
#[command(name = "registry-proxy")]
#[command(version)]
#[command(about = "A rewriting reverse proxy for the Terraform registry and releases")]
struct Args {
    /// FQDN of the registry proxy host
    #[arg(long, env = "REGISTRY_PROXY_HOST", required_unless_present = "mappings")]
    registry_proxy_host: Option<String>,

    /// FQDN of the release proxy host
    #[arg(long, env = "RELEASE_PROXY_HOST", required_unless_present = "mappings")]
    release_proxy_host: Option<String>,

    /// Prefix prepended to release artifact paths, e.g. /artifactory/hashicorp-releases
    #[arg(long, env = "RELEASE_PROXY_PATH_PREFIX", default_value = "")]
    release_proxy_path_prefix: String,

    /// HTTP address to listen on, e.g. :8080 or 127.0.0.1:8080
    #[arg(long, env = "HTTP_ADDRESS", default_value = ":8555")]
    http_address: String,

    /// Terraform version announced to the upstream services
    #[arg(long, env = "TERRAFORM_VERSION", default_value = DEFAULT_TERRAFORM_VERSION)]
    terraform_version: String,

    /// JSON mapping table used instead of the registry/release host flags
    #[arg(long, env = "MAPPINGS_FILE", conflicts_with_all = ["registry_proxy_host", "release_proxy_host"])]
    mappings: Option<PathBuf>,

    /// Largest response body buffered for rewriting, in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    max_body_bytes: usize,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Accept Go-style ":port" addresses as "all interfaces"
fn parse_listen_address(address: &str) -> Result<SocketAddr> {
    let address = if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    };
    address
        .parse()
        .with_context(|| format!("invalid HTTP address '{}'", address))
}

fn build_configuration(args: &Args) -> Result<ProxyConfiguration> {
    let config = match &args.mappings {
        Some(path) => ProxyConfiguration::from_file(path)?,
        None => ProxyConfiguration::terraform(
            args.registry_proxy_host.as_deref().unwrap_or_default(),
            args.release_proxy_host.as_deref().unwrap_or_default(),
            &args.release_proxy_path_prefix,
            &args.terraform_version,
        )?,
    };
    Ok(config.with_max_body_bytes(args.max_body_bytes))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting registry-proxy v{}", env!("CARGO_PKG_VERSION"));

    let config = build_configuration(&args).context("invalid proxy configuration")?;
    for mapping in config.mappings() {
        info!(
            "Mapping {} -> {}{}",
            mapping.public_host(),
            mapping.upstream_host(),
            if mapping.rewrite_links() {
                format!(" (links rewritten to {})", mapping.public_url_prefix())
            } else {
                String::new()
            }
        );
    }

    let addr = parse_listen_address(&args.http_address)?;
    let upstream = HttpsUpstream::new().context("failed to build upstream client")?;
    let server = ProxyServer::new(ProxyEngine::new(Arc::new(config), upstream));

    tokio::select! {
        result = server.run(addr) => {
            if let Err(e) = &result {
                error!("Server stopped: {:#}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
