//! Print the Cat CustomResourceDefinition as YAML.
//!
//! `cargo run --bin crdgen > config/crd/cats.yaml`

use anyhow::{Context, Result};
use cat_operator::Cat;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let yaml = serde_yaml::to_string(&Cat::crd()).context("Failed to serialize Cat CRD")?;
    print!("{yaml}");
    Ok(())
}
