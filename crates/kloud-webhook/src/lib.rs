//! Admission webhook binding pods and services to gateway overlay addresses
//!
//! [`mutate`] holds the pod and service mutators, [`gateway`] the admin API
//! client they call, and [`server`] the axum routes serving both.

#![deny(missing_docs)]

pub mod error;
pub mod gateway;
pub mod mutate;
pub mod server;

pub use error::WebhookError;
pub use gateway::{GatewayClient, HttpGatewayClient};
pub use mutate::WebhookState;
pub use server::{router, start_server, ServerConfig};
