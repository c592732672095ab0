//! Operator configuration
//!
//! Everything is read from environment variables so the operator can be
//! configured from its Deployment manifest.

use std::path::PathBuf;

use thiserror::Error;

/// Default port for the admission webhook server
pub const DEFAULT_WEBHOOK_PORT: u16 = 9443;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a port number, got {value:?}")]
    InvalidPort { var: &'static str, value: String },
    #[error("{present} is set but {missing} is not; both are needed to serve TLS")]
    IncompleteTls {
        present: &'static str,
        missing: &'static str,
    },
}

/// Certificate and key used by the webhook server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Runtime configuration for the operator process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Restrict the controller to one namespace; all namespaces when `None`
    pub watch_namespace: Option<String>,
    /// Port for the admission webhook server
    pub webhook_port: u16,
    /// Serve the webhook over TLS when set
    pub webhook_tls: Option<TlsPaths>,
    /// Port for the health check server
    pub health_port: u16,
}

impl OperatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WATCH_NAMESPACE`: namespace to watch (default: all)
    /// - `WEBHOOK_PORT`: admission webhook port (default: 9443)
    /// - `WEBHOOK_TLS_CERT` / `WEBHOOK_TLS_KEY`: PEM files for the webhook
    /// - `HEALTH_PORT`: health check port (default: 8081)
    ///
    /// # Errors
    ///
    /// Returns an error if a port is not a number or only one TLS path is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.is_empty());
        let webhook_port = parse_port(&lookup, "WEBHOOK_PORT", DEFAULT_WEBHOOK_PORT)?;
        let health_port = parse_port(&lookup, "HEALTH_PORT", crate::health::DEFAULT_HEALTH_PORT)?;

        let webhook_tls = match (lookup("WEBHOOK_TLS_CERT"), lookup("WEBHOOK_TLS_KEY")) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            (Some(_), None) => {
                return Err(ConfigError::IncompleteTls {
                    present: "WEBHOOK_TLS_CERT",
                    missing: "WEBHOOK_TLS_KEY",
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::IncompleteTls {
                    present: "WEBHOOK_TLS_KEY",
                    missing: "WEBHOOK_TLS_CERT",
                })
            }
            (None, None) => None,
        };

        Ok(Self {
            watch_namespace,
            webhook_port,
            webhook_tls,
            health_port,
        })
    }
}

fn parse_port(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: u16,
) -> Result<u16, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidPort { var, value }),
        None => Ok(default),
    }
}

/// Labels put on every pod the operator creates
pub mod labels {
    /// Marks the pod as managed by this operator
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    /// Value of [`MANAGED_BY`]
    pub const MANAGER: &str = "cat-operator";
    /// Name of the owning Cat
    pub const CAT: &str = "example.cats.io/cat";
}
