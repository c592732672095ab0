//! Leader election across operator replicas.
//!
//! Only the replica holding the `Lease` runs the Cat controller. Standbys
//! block in [`LeaderElection::acquire`]; the leader keeps renewing in
//! [`LeaderElection::keep_renewing`], which returns an error once the lease is
//! lost so the process can shut down and restart as a standby.

use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use k8s_openapi::api::coordination::v1::Lease;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tracing::{info, trace, warn};

use crate::duration;

/// Lease name used when `LEADER_ELECTION_LEASE_NAME` is unset
pub const DEFAULT_LEASE_NAME: &str = "cat-operator-leader";

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive renewal errors tolerated before giving up the lease
const MAX_RENEWAL_FAILURES: u32 = 3;

/// Settings for the lease lock.
///
/// Build with [`LeaderElectionConfig::from_env`] or [`LeaderElectionConfig::new`];
/// both reject a renew interval that is not shorter than the lease duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    enabled: bool,
    lease_name: String,
    namespace: String,
    holder_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    /// # Errors
    ///
    /// Returns an error if any name is empty or `renew_interval >= lease_duration`.
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        holder_id: impl Into<String>,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self> {
        let (lease_name, namespace, holder_id) =
            (lease_name.into(), namespace.into(), holder_id.into());
        ensure!(!lease_name.is_empty(), "lease_name cannot be empty");
        ensure!(!namespace.is_empty(), "namespace cannot be empty");
        ensure!(!holder_id.is_empty(), "holder_id cannot be empty");
        ensure!(
            renew_interval < lease_duration,
            "renew_interval ({renew_interval:?}) must be less than lease_duration ({lease_duration:?})"
        );

        Ok(Self {
            enabled: true,
            lease_name,
            namespace,
            holder_id,
            lease_duration,
            renew_interval,
        })
    }

    /// Single-replica mode
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            namespace: String::new(),
            holder_id: String::new(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }

    /// Load settings from environment variables.
    ///
    /// - `LEADER_ELECTION_ENABLED`: `true` to enable (default: disabled)
    /// - `LEADER_ELECTION_LEASE_NAME`: Lease name (default: `cat-operator-leader`)
    /// - `POD_NAMESPACE`: namespace of the Lease (required when enabled)
    /// - `POD_NAME`: holder identity (required when enabled)
    /// - `LEADER_ELECTION_LEASE_DURATION`: e.g. `15s`, or plain seconds (default: 15s)
    /// - `LEADER_ELECTION_RENEW_INTERVAL`: e.g. `5s`, or plain seconds (default: 5s)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let enabled = lookup("LEADER_ELECTION_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return Ok(Self::disabled());
        }

        let lease_name = lookup("LEADER_ELECTION_LEASE_NAME")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string());
        let namespace = lookup("POD_NAMESPACE")
            .context("POD_NAMESPACE required when leader election is enabled")?;
        let holder_id =
            lookup("POD_NAME").context("POD_NAME required when leader election is enabled")?;

        let lease_duration = interval_from(
            &lookup,
            "LEADER_ELECTION_LEASE_DURATION",
            DEFAULT_LEASE_DURATION,
        )?;
        let renew_interval = interval_from(
            &lookup,
            "LEADER_ELECTION_RENEW_INTERVAL",
            DEFAULT_RENEW_INTERVAL,
        )?;

        Self::new(lease_name, namespace, holder_id, lease_duration, renew_interval)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

/// Read a positive interval, accepting `"15s"` style strings or bare seconds
fn interval_from(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };

    let interval = match raw.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => duration::parse(&raw)
            .with_context(|| format!("{var} is not a duration"))?
            .to_std()
            .with_context(|| format!("{var} is out of range"))?,
    };

    if interval.is_zero() {
        bail!("{var} must be positive, got {raw:?}");
    }
    Ok(interval)
}

fn holder_of(lease: Option<&Lease>) -> &str {
    lease
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.as_deref())
        .unwrap_or("unknown")
}

/// Lease-based leadership for one replica
pub struct LeaderElection {
    lease_lock: LeaseLock,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            config.namespace(),
            LeaseLockParams {
                holder_id: config.holder_id().to_string(),
                lease_name: config.lease_name().to_string(),
                lease_ttl: config.lease_duration(),
            },
        );

        Self {
            lease_lock,
            renew_interval: config.renew_interval(),
        }
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) {
        info!("Waiting for leadership");

        loop {
            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!(holder = %holder_of(result.lease.as_ref()), "Leadership acquired");
                    return;
                }
                Ok(result) => {
                    info!(
                        current_holder = %holder_of(result.lease.as_ref()),
                        "Another replica is leader, waiting"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Failed to check leadership, retrying");
                }
            }

            tokio::time::sleep(self.renew_interval).await;
        }
    }

    /// Renew the lease until leadership is lost.
    ///
    /// # Errors
    ///
    /// Returns once another replica takes the lease or after
    /// `MAX_RENEWAL_FAILURES` consecutive renewal errors. Never returns `Ok`.
    pub async fn keep_renewing(self) -> Result<()> {
        let mut interval = tokio::time::interval(self.renew_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        loop {
            interval.tick().await;

            match self.lease_lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    if failures > 0 {
                        info!(previous_failures = failures, "Lease renewed after failures");
                    }
                    failures = 0;
                    trace!("Lease renewed");
                }
                Ok(result) => {
                    bail!(
                        "leadership lost to {}",
                        holder_of(result.lease.as_ref())
                    );
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_RENEWAL_FAILURES {
                        return Err(anyhow::Error::new(e)
                            .context(format!("lease renewal failed {failures} times in a row")));
                    }
                    warn!(error = %e, attempt = failures, "Lease renewal failed, will retry");
                }
            }
        }
    }
}
