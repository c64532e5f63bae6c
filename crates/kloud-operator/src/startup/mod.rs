//! Startup steps run before the controllers start

mod crds;

pub use crds::{ensure_crds_installed, FIELD_MANAGER};
