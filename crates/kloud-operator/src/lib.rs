//! Kloud operator: CRD installation, composition root and controller runner

#![deny(missing_docs)]

pub mod config;
pub mod controller_runner;
/// Startup steps (CRD install)
pub mod startup;
