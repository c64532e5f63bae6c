//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Kloud - CRD-driven platform operator
#[derive(Parser, Debug)]
#[command(name = "kloud", version, about, long_about = None)]
pub struct Cli {
    /// Print every CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// What to run; `controller` when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operator modes
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every resource controller
    Controller(ControllerArgs),
    /// Run the pod and service admission mutator
    Webhook(WebhookArgs),
}

/// Controller mode options
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// NATS server for status notifications; notifications are disabled when unset
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// Subject prefix for status notifications
    #[arg(long, env = "STATUS_SUBJECT_PREFIX", default_value = "kloud.status")]
    pub status_subject_prefix: String,

    /// Reconciles running at once per controller
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    pub max_concurrent_reconciles: u16,

    /// Requeue delay in seconds while an object is not ready
    #[arg(long, env = "RECONCILE_RETRY_SECS", default_value_t = 5)]
    pub reconcile_retry_secs: u64,
}

impl ControllerArgs {
    /// Options from the environment and defaults alone
    pub fn from_env() -> Result<Self, clap::Error> {
        #[derive(Parser)]
        struct Env {
            #[command(flatten)]
            args: ControllerArgs,
        }
        Ok(Env::try_parse_from(["kloud"])?.args)
    }

    /// Not-ready requeue delay
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.reconcile_retry_secs.max(1))
    }
}

/// Webhook mode options
#[derive(Args, Debug, Clone)]
pub struct WebhookArgs {
    /// Base URL of the gateway admin API
    #[arg(long, env = "GATEWAY_ADMIN_URL")]
    pub gateway_admin_url: String,

    /// Listen address
    #[arg(long, env = "WEBHOOK_ADDR", default_value = "0.0.0.0:8443")]
    pub addr: SocketAddr,

    /// TLS certificate PEM file
    #[arg(long, env = "WEBHOOK_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key PEM file
    #[arg(long, env = "WEBHOOK_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Image of the injected tunnel sidecar
    #[arg(
        long,
        env = "TUNNEL_SIDECAR_IMAGE",
        default_value = "ghcr.io/kloud-dev/tunnel:latest"
    )]
    pub sidecar_image: String,
}
