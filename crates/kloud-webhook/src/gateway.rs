//! Gateway admin API client
//!
//! The gateway hands out overlay addresses. Pods and services are
//! registered at admission time and released when they are deleted; the
//! `(ip, uid)` pair returned at registration identifies the binding.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::WebhookError;

/// An overlay address bound to a pod or service
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Binding {
    /// Assigned overlay IP
    pub ip: String,
    /// Binding id, required to release the address
    pub uid: String,
}

/// A pod binding plus the tunnel client configuration for the pod
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodBinding {
    /// The address binding
    #[serde(flatten)]
    pub binding: Binding,
    /// Peer configuration the sidecar boots from
    pub peer_config: String,
}

/// Pod identity sent on registration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PodRegistration {
    /// Pod namespace
    pub namespace: String,
    /// Pod name, or its generateName prefix when the name is not set yet
    pub name: String,
}

/// Gateway admin API operations used by the mutator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// `POST /pod`
    async fn register_pod(&self, pod: &PodRegistration) -> Result<PodBinding, WebhookError>;

    /// `DELETE /pod/{ip}/{uid}`
    async fn release_pod(&self, binding: &Binding) -> Result<(), WebhookError>;

    /// `POST /service/{namespace}/{name}`
    async fn register_service(&self, namespace: &str, name: &str) -> Result<Binding, WebhookError>;

    /// `DELETE /service/{ip}/{uid}`
    async fn release_service(&self, binding: &Binding) -> Result<(), WebhookError>;
}

/// [`GatewayClient`] over HTTP
pub struct HttpGatewayClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGatewayClient {
    /// Client for the gateway admin API at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn delete(&self, path: String) -> Result<(), WebhookError> {
        let resp = self.http.delete(self.url(&path)).send().await?;
        // Already released is fine
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(path = %path, "Binding already released");
            return Ok(());
        }
        resp.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl GatewayClient for HttpGatewayClient {
    async fn register_pod(&self, pod: &PodRegistration) -> Result<PodBinding, WebhookError> {
        Ok(self
            .http
            .post(self.url("/pod"))
            .json(pod)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn release_pod(&self, binding: &Binding) -> Result<(), WebhookError> {
        self.delete(format!("/pod/{}/{}", binding.ip, binding.uid)).await
    }

    async fn register_service(&self, namespace: &str, name: &str) -> Result<Binding, WebhookError> {
        Ok(self
            .http
            .post(self.url(&format!("/service/{namespace}/{name}")))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn release_service(&self, binding: &Binding) -> Result<(), WebhookError> {
        self.delete(format!("/service/{}/{}", binding.ip, binding.uid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_binding_reads_flat_gateway_responses() {
        let binding: PodBinding = serde_json::from_str(
            r#"{"ip": "10.13.0.7", "uid": "b-42", "peerConfig": "[Interface]\nAddress = 10.13.0.7/32\n"}"#,
        )
        .unwrap();
        assert_eq!(binding.binding.ip, "10.13.0.7");
        assert_eq!(binding.binding.uid, "b-42");
        assert!(binding.peer_config.starts_with("[Interface]"));
    }

    #[test]
    fn base_url_trailing_slash_is_ignored() {
        let client = HttpGatewayClient::new("http://gateway.kloud:8080/").unwrap();
        assert_eq!(client.url("/pod"), "http://gateway.kloud:8080/pod");
    }
}
