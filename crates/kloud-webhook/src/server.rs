//! Admission webhook server

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{info, warn};

use crate::error::WebhookError;
use crate::mutate::{pod_handler, service_handler, WebhookState};

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate PEM file; plain HTTP when unset
    pub tls_cert: Option<PathBuf>,
    /// TLS private key PEM file
    pub tls_key: Option<PathBuf>,
}

/// Router serving the mutation endpoints
pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/mutate/pod", post(pod_handler))
        .route("/mutate/service", post(service_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve admission requests until the process exits
pub async fn start_server(config: ServerConfig, state: Arc<WebhookState>) -> Result<(), WebhookError> {
    let app = router(state);

    match (config.tls_cert, config.tls_key) {
        (Some(cert), Some(key)) => {
            let tls_config = RustlsConfig::from_pem_file(&cert, &key)
                .await
                .map_err(|e| WebhookError::Server(format!("TLS config error: {e}")))?;
            info!(addr = %config.addr, "Starting admission webhook (TLS)");
            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| WebhookError::Server(e.to_string()))
        }
        (cert, key) => {
            if cert.is_some() || key.is_some() {
                warn!("Only one of the TLS cert and key is set, serving plain HTTP");
            }
            info!(addr = %config.addr, "Starting admission webhook");
            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
                .map_err(|e| WebhookError::Server(e.to_string()))
        }
    }
}
