//! cat-operator: Kubernetes controller that runs a Cat's lives as pods

pub mod admission;
pub mod cat;
pub mod config;
pub mod controllers;
pub mod duration;
pub mod health;
pub mod leader;
pub mod owner_index;
pub mod store;

#[cfg(test)]
pub mod test_utils;

pub use cat::{Cat, CatSpec, CatStatus};
pub use config::OperatorConfig;

/// Install the process-wide rustls crypto provider used by the webhook server.
pub fn init_crypto_provider() {
    // Only fails when a provider is already installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
