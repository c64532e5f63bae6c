//! Resource controllers for kloud
//!
//! [`engine`] is the generic loop every controller runs. Each kind module
//! provides a [`engine::Reconciler`] with the kind's apply, observe and
//! readiness logic plus the watch graph mapping child events back to it.

#![deny(missing_docs)]

pub mod app;
pub mod children;
pub mod database;
pub mod engine;
pub mod managed_resource;
pub mod managed_service;
pub mod project;
pub mod router;
pub mod secrets;

#[cfg(test)]
mod testing;

pub use app::AppReconciler;
pub use database::DatabaseReconciler;
pub use engine::{Context, Reconciler};
pub use managed_resource::ManagedResourceReconciler;
pub use managed_service::ManagedServiceReconciler;
pub use project::ProjectReconciler;
pub use router::RouterReconciler;
