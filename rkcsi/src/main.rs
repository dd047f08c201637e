//! # rkcsi: block-volume CSI node plugin
//!
//! Runs on every worker node. Serves the CSI Identity and Node services over
//! QUIC and acts on the host: finds attached virtio disks, formats them
//! (optionally under LUKS), mounts, bind-mounts and grows them.
//!
//! Must run as root: it calls `mount(2)`, `mkfs.*` and `cryptsetup`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::backend::block::DEFAULT_PLUGIN_NAME;
use libcsi::transport::CsiServer;
use libcsi::{BlockNodeBackend, SystemMounter, UdevDeviceResolver};
use tracing::info;

mod config;
mod tls;

use config::NODE_TUNABLES;

/// CSI node plugin for remotely attached block volumes
#[derive(Parser, Debug)]
#[command(name = "rkcsi")]
#[command(version, about, long_about = None)]
struct Args {
    /// Identifier of this node as known to the cloud (server id)
    #[arg(long, env = "RKCSI_NODE_ID")]
    node_id: String,

    /// Region the node runs in, reported as its topology
    #[arg(long, env = "RKCSI_REGION")]
    region: String,

    /// QUIC listen address
    #[arg(long, env = "RKCSI_LISTEN", default_value = "0.0.0.0:7443")]
    listen: SocketAddr,

    /// PEM certificate chain presented to clients
    #[arg(long, env = "RKCSI_TLS_CERT", value_name = "FILE")]
    tls_cert: PathBuf,

    /// PEM private key for the certificate
    #[arg(long, env = "RKCSI_TLS_KEY", value_name = "FILE")]
    tls_key: PathBuf,

    /// Plugin name reported by GetPluginInfo
    #[arg(long, env = "RKCSI_PLUGIN_NAME", default_value = DEFAULT_PLUGIN_NAME)]
    plugin_name: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "RKCSI_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "RKCSI_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json)?;

    let tunables = &*NODE_TUNABLES;
    info!(
        node_id = %args.node_id,
        region = %args.region,
        ?tunables,
        "starting rkcsi"
    );

    let tls_config = tls::load_server_config(&args.tls_cert, &args.tls_key)?;

    let resolver = Arc::new(UdevDeviceResolver::new(tunables.resolver_config()));
    let mounter = Arc::new(SystemMounter::new(tunables.mounter_config()));
    let backend = BlockNodeBackend::new(args.node_id, args.region, resolver, mounter)
        .with_plugin_name(args.plugin_name);

    let server = CsiServer::new(args.listen, tls_config, Arc::new(backend))
        .context("failed to start CSI server")?;

    tokio::select! {
        result = server.serve() => result.context("CSI server stopped")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("shutdown requested");
            server.endpoint().close(0u32.into(), b"shutdown");
        }
    }

    server.endpoint().wait_idle().await;
    info!("rkcsi stopped");
    Ok(())
}

/// Initialize the tracing subscriber.
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_with_defaults() {
        let args = Args::try_parse_from([
            "rkcsi",
            "--node-id",
            "srv-1",
            "--region",
            "rma",
            "--tls-cert",
            "/etc/rkcsi/tls.crt",
            "--tls-key",
            "/etc/rkcsi/tls.key",
        ])
        .unwrap();
        assert_eq!(args.node_id, "srv-1");
        assert_eq!(args.listen, "0.0.0.0:7443".parse().unwrap());
        assert_eq!(args.plugin_name, DEFAULT_PLUGIN_NAME);
        assert!(!args.log_json);
    }

    #[test]
    fn node_id_is_required() {
        let result = Args::try_parse_from([
            "rkcsi",
            "--region",
            "rma",
            "--tls-cert",
            "a",
            "--tls-key",
            "b",
        ]);
        assert!(result.is_err());
    }
}
