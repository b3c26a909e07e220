//! # Clean
//!
//! One-shot cleanup utility, runs the full three-phase garbage collection
//! against the named cluster and exits 0 on success, 1 on any failure

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use nsx_vpc_operator::{
    cmd,
    logging,
    svc::nsx::{
        self,
        client::{Client, HyperTransport},
        gc::{CleanupContext, LiveSet},
    },
};

// -----------------------------------------------------------------------------
// Args structure

#[derive(Parser, Clone, Debug)]
#[command(name = "clean", about = "Remove every fabric object owned by the given cluster", version)]
pub struct Args {
    /// Name of the cluster to clean up
    #[arg(long = "cluster")]
    pub cluster: String,
    /// Fabric manager address
    #[arg(long = "mgr-ip")]
    pub mgr_ip: String,
    /// Fabric user name
    #[arg(long = "nsx-user", default_value = "")]
    pub nsx_user: String,
    /// Fabric password
    #[arg(long = "nsx-passwd", default_value = "")]
    pub nsx_passwd: String,
    /// Certificate authority bundle to trust
    #[arg(long = "ca-file")]
    pub ca_file: Option<std::path::PathBuf>,
    /// Certificate thumbprint of the fabric manager
    #[arg(long = "thumbprint")]
    pub thumbprint: Option<String>,
    /// vCenter endpoint
    #[arg(long = "vc-endpoint")]
    pub vc_endpoint: Option<String>,
    /// vCenter user name
    #[arg(long = "vc-user")]
    pub vc_user: Option<String>,
    /// vCenter password
    #[arg(long = "vc-passwd")]
    pub vc_passwd: Option<String>,
    /// vCenter single sign-on domain
    #[arg(long = "vc-sso-domain")]
    pub vc_sso_domain: Option<String>,
    /// vCenter https port
    #[arg(long = "vc-https-port", default_value_t = 443)]
    pub vc_https_port: u16,
    /// Envoy sidecar host, used instead of the manager address when set
    #[arg(long = "envoyhost")]
    pub envoy_host: Option<String>,
    /// Envoy sidecar port
    #[arg(long = "envoyport")]
    pub envoy_port: Option<u16>,
    /// Log level, one of error, warn, info, debug or trace
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
}

impl Args {
    fn verbosity(&self) -> usize {
        match self.log_level.as_str() {
            "error" => 0,
            "warn" => 1,
            "info" => 2,
            "debug" => 3,
            _ => 4,
        }
    }

    fn endpoint(&self) -> String {
        match (&self.envoy_host, self.envoy_port) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_owned(),
            _ => self.mgr_ip.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// clean function

async fn clean(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let transport = HyperTransport::try_new(args.ca_file.as_deref())?;
    let client = Client::new(
        std::sync::Arc::new(transport),
        vec![args.endpoint()],
        &args.nsx_user,
        &args.nsx_passwd,
        &args.cluster,
    )?;

    let version = client.node_version().await?;
    nsx::check_version(&version)?;

    if let Some(endpoint) = &args.vc_endpoint {
        info!(
            endpoint = endpoint,
            domain = args.vc_sso_domain.as_deref().unwrap_or("vsphere.local"),
            port = args.vc_https_port,
            "Using vCenter session for supervisor inventory",
        );
    }

    // no live custom resources, every owned object is garbage
    let ctx = CleanupContext {
        nsx: client.to_owned(),
        cluster: args.cluster.to_owned(),
        live: LiveSet::default(),
    };

    cmd::collector(&client).collect(&ctx).await?;
    Ok(())
}

// -----------------------------------------------------------------------------
// main entrypoint

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = logging::initialize(args.verbosity(), false) {
        eprintln!("failed to initialize logging system, {err}");
        return ExitCode::FAILURE;
    }

    info!(cluster = &args.cluster, "Start cleanup of fabric objects");
    match clean(&args).await {
        Ok(()) => {
            info!(cluster = &args.cluster, "Cleanup completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = err.to_string(), "Cleanup failed");
            ExitCode::FAILURE
        }
    }
}
