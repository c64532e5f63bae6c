//! Kloud operator - CRD-driven platform controllers and admission mutator

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{info, warn};

use kloud_common::apply::KubeApplier;
use kloud_common::crd::all_crds;
use kloud_common::kind_registry::KindRegistry;
use kloud_common::notifier::{NatsStatusNotifier, NoopStatusNotifier, StatusNotifier};
use kloud_common::retry::{retry_with_backoff, RetryConfig};
use kloud_common::telemetry::{init_telemetry, TelemetryConfig};
use kloud_operator::config::{Cli, Command, ControllerArgs, WebhookArgs};
use kloud_operator::controller_runner::{build_all_controllers, Shared};
use kloud_operator::startup::ensure_crds_installed;
use kloud_webhook::{HttpGatewayClient, ServerConfig, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let command = match cli.command {
        Some(command) => command,
        None => Command::Controller(ControllerArgs::from_env()?),
    };

    let service_name = match &command {
        Command::Controller(_) => "kloud-controller",
        Command::Webhook(_) => "kloud-webhook",
    };
    init_telemetry(TelemetryConfig::from_env(service_name))?;

    match command {
        Command::Controller(args) => run_controller(args).await,
        Command::Webhook(args) => run_webhook(args).await,
    }
}

/// Composition root for controller mode
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create kube client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let notifier: Arc<dyn StatusNotifier> = match &args.nats_url {
        Some(url) => {
            let (url, prefix) = (url.as_str(), args.status_subject_prefix.as_str());
            let notifier = retry_with_backoff(
                &RetryConfig::with_max_attempts(10),
                "connect to NATS",
                move || NatsStatusNotifier::connect(url, prefix),
            )
            .await?;
            info!(url = %url, prefix = %args.status_subject_prefix, "Publishing status to NATS");
            Arc::new(notifier)
        }
        None => {
            warn!("NATS_URL not set, status notifications disabled");
            Arc::new(NoopStatusNotifier)
        }
    };

    let registry = Arc::new(KindRegistry::new(client.clone()));
    let shared = Shared {
        applier: Arc::new(KubeApplier::new(client.clone(), registry.clone())),
        client,
        registry,
        notifier,
        retry_after: args.retry_after(),
        concurrency: args.max_concurrent_reconciles,
    };

    info!("Starting controllers:");
    futures::future::join_all(build_all_controllers(&shared)).await;

    info!("Controllers stopped");
    Ok(())
}

/// Composition root for webhook mode
async fn run_webhook(args: WebhookArgs) -> anyhow::Result<()> {
    let gateway = HttpGatewayClient::new(&args.gateway_admin_url)?;
    info!(gateway = %args.gateway_admin_url, image = %args.sidecar_image, "Starting admission mutator");

    let state = Arc::new(WebhookState {
        gateway: Arc::new(gateway),
        sidecar_image: args.sidecar_image,
    });
    let config = ServerConfig {
        addr: args.addr,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
    };
    kloud_webhook::start_server(config, state).await?;
    Ok(())
}
