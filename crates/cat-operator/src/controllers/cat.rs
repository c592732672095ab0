//! Cat controller
//!
//! Watches example.cats.io/v1alpha1 Cat resources and the pods they own, and
//! runs each Cat through its lives: one pod per life, a cooldown between
//! lives, until `status.currentLife` reaches `spec.totalLives`.
//!
//! ## State
//!
//! All state lives in the Cat status subresource. `lastCatPodName` and
//! `lastCatPodPhase` track the pod of the current life; a pod whose recorded
//! phase is terminal has already been handled and deleted, so it is not
//! fetched again. `lastCatPodFinishedTime` anchors the cooldown.
//!
//! Pods are never deleted on Cat deletion: they carry a controller owner
//! reference and the API server garbage collector removes them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cat::{Cat, CatPhase, CatStatus, PodPhase};
use crate::config::labels;
use crate::duration::{self, DurationError};
use crate::owner_index::{owner_reference, owning_cat};
use crate::store::StoreError;

use super::retry::{compute_backoff, RetryPolicy};
use super::ControllerContext;

/// Requeue delay after a failed pod create or delete
const POD_WRITE_RETRY: Duration = Duration::from_secs(10);

const POD_IMAGE: &str = "alpine:latest";
const POD_CONTAINER: &str = "main";

#[derive(Debug, Error)]
pub enum CatError {
    #[error("failed to fetch Cat: {0}")]
    CatFetch(#[source] StoreError),
    #[error("invalid duration {value:?}: {source}")]
    InvalidDuration {
        value: String,
        #[source]
        source: DurationError,
    },
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("failed to fetch pod {name}: {source}")]
    PodFetch {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to create pod {name}: {source}")]
    PodCreate {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to delete pod {name}: {source}")]
    PodDelete {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to update Cat status: {0}")]
    StatusUpdate(#[source] StoreError),
}

/// Outcome of a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Nothing more to do until something changes
    Done,
    /// Reconcile again after the delay
    RequeueAfter(Duration),
}

impl From<Directive> for Action {
    fn from(directive: Directive) -> Self {
        match directive {
            Directive::Done => Action::await_change(),
            Directive::RequeueAfter(delay) => Action::requeue(delay),
        }
    }
}

/// Time left before the next life may start, if any
fn cooldown_remaining(
    status: &CatStatus,
    cooldown: TimeDelta,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let finished = status.last_cat_pod_finished_time?;
    let next_start = finished
        .checked_add_signed(cooldown)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (next_start - now).to_std().ok().filter(|wait| !wait.is_zero())
}

fn observed_phase(pod: &Pod) -> PodPhase {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .and_then(|p| p.parse().ok())
        .unwrap_or(PodPhase::Unknown)
}

/// The single-shot pod that runs one life of `cat`
fn life_pod(cat: &Cat, life: i32, message: &str) -> Result<Pod, CatError> {
    let owner = owner_reference(cat).ok_or(CatError::MissingField("metadata.uid"))?;

    let labels = BTreeMap::from([
        (labels::MANAGED_BY.to_string(), labels::MANAGER.to_string()),
        (labels::CAT.to_string(), cat.name_any()),
    ]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(cat.life_pod_name(life)),
            namespace: cat.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: POD_CONTAINER.to_string(),
                image: Some(POD_IMAGE.to_string()),
                command: Some(vec!["sh".to_string(), "-c".to_string()]),
                args: Some(vec![format!("echo \"{message}\"")]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

async fn delete_pod(ctx: &ControllerContext, namespace: &str, name: &str) -> Result<(), CatError> {
    match ctx.pods.delete(namespace, name).await {
        Ok(()) => {
            debug!(pod = %name, "Deleted finished pod");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(pod = %name, "Finished pod already gone");
            Ok(())
        }
        Err(source) => Err(CatError::PodDelete {
            name: name.to_string(),
            source,
        }),
    }
}

/// Fold the tracked pod's current phase into `status`.
///
/// Returns `true` when the pod reached a terminal phase in this pass.
async fn observe_tracked_pod(
    ctx: &ControllerContext,
    namespace: &str,
    status: &mut CatStatus,
    now: DateTime<Utc>,
) -> Result<bool, CatError> {
    let pod_name = status.last_cat_pod_name.clone();

    let pod = ctx
        .pods
        .get(namespace, &pod_name)
        .await
        .and_then(|found| {
            found.ok_or_else(|| StoreError::NotFound {
                kind: "Pod".to_string(),
                name: pod_name.clone(),
            })
        })
        .map_err(|source| CatError::PodFetch {
            name: pod_name.clone(),
            source,
        })?;

    let phase = observed_phase(&pod);
    if status.last_cat_pod_phase == Some(phase) {
        debug!(pod = %pod_name, phase = %phase, "Pod phase unchanged");
        return Ok(false);
    }

    let mut finished = false;
    match phase {
        PodPhase::Failed => {
            let reason = pod
                .status
                .as_ref()
                .and_then(|s| s.message.as_deref())
                .unwrap_or_default();
            warn!(pod = %pod_name, life = status.current_life, reason = %reason, "Life pod failed");

            status.phase = Some(CatPhase::Error);
            status.last_cat_pod_finished_time = Some(now);
            status.message = format!("pod {pod_name} has failed with: {reason}");
            delete_pod(ctx, namespace, &pod_name).await?;
            finished = true;
        }
        PodPhase::Succeeded => {
            status.current_life += 1;
            status.last_cat_pod_finished_time = Some(now);
            status.message = format!(
                "life {} pod: {} finished successfully",
                status.current_life, pod_name
            );
            info!(pod = %pod_name, life = status.current_life, "Life finished");
            delete_pod(ctx, namespace, &pod_name).await?;
            finished = true;
        }
        PodPhase::Running => {
            status.message = format!("life {} running pod: {}", status.current_life, pod_name);
            debug!(pod = %pod_name, "Life pod running");
        }
        PodPhase::Pending | PodPhase::Unknown => {}
    }

    status.last_cat_pod_phase = Some(phase);
    Ok(finished)
}

/// Create the pod for the current life and start tracking it.
///
/// A live pod that already exists under the same name counts as created. One
/// that is still terminating belongs to an earlier attempt and is not adopted.
async fn spawn_life_pod(
    ctx: &ControllerContext,
    cat: &Cat,
    namespace: &str,
    status: &mut CatStatus,
    message: &str,
) -> Result<(), CatError> {
    let pod = life_pod(cat, status.current_life, message)?;
    let pod_name = pod.name_any();

    match ctx.pods.create(namespace, &pod).await {
        Ok(_) => {
            info!(pod = %pod_name, life = status.current_life, "Created life pod");
        }
        Err(e) if e.is_already_exists() => {
            let existing = ctx
                .pods
                .get(namespace, &pod_name)
                .await
                .map_err(|source| CatError::PodFetch {
                    name: pod_name.clone(),
                    source,
                })?;
            match existing {
                Some(pod) if pod.metadata.deletion_timestamp.is_none() => {
                    debug!(pod = %pod_name, "Life pod already exists, tracking it");
                }
                _ => {
                    debug!(pod = %pod_name, "Previous pod still terminating");
                    return Err(CatError::PodCreate {
                        name: pod_name,
                        source: e,
                    });
                }
            }
        }
        Err(source) => {
            return Err(CatError::PodCreate {
                name: pod_name,
                source,
            })
        }
    }

    status.last_cat_pod_name = pod_name;
    status.last_cat_pod_phase = Some(PodPhase::Unknown);
    Ok(())
}

async fn persist_status(
    ctx: &ControllerContext,
    mut cat: Cat,
    namespace: &str,
    name: &str,
    status: CatStatus,
) -> Result<(), CatError> {
    cat.status = Some(status);
    ctx.cats
        .replace_status(namespace, name, &cat)
        .await
        .map_err(CatError::StatusUpdate)?;
    Ok(())
}

/// Run one reconciliation pass for the Cat `namespace/name`.
#[instrument(skip_all, fields(namespace = %namespace, name = %name))]
pub async fn reconcile_cat(
    namespace: &str,
    name: &str,
    ctx: &ControllerContext,
) -> Result<Directive, CatError> {
    let Some(cat) = ctx
        .cats
        .get(namespace, name)
        .await
        .map_err(CatError::CatFetch)?
    else {
        debug!("Cat no longer exists");
        return Ok(Directive::Done);
    };
    let mut status = cat.status.clone().unwrap_or_default();

    if status.phase == Some(CatPhase::Completed) {
        debug!("Cat completed, nothing to do");
        return Ok(Directive::Done);
    }

    let raw_duration = cat.spec.duration.clone().unwrap_or_default();
    let cooldown = duration::parse(&raw_duration).map_err(|source| CatError::InvalidDuration {
        value: raw_duration.clone(),
        source,
    })?;

    let now = ctx.clock.now();
    if let Some(wait) = cooldown_remaining(&status, cooldown, now) {
        debug!(wait_ms = wait.as_millis() as u64, "Cooling down before next life");
        return Ok(Directive::RequeueAfter(wait));
    }

    let total_lives = cat
        .spec
        .total_lives
        .ok_or(CatError::MissingField("spec.totalLives"))?;
    let message = cat
        .spec
        .message
        .clone()
        .ok_or(CatError::MissingField("spec.message"))?;

    let tracking = !status.last_cat_pod_name.is_empty()
        && !status.last_cat_pod_phase.is_some_and(PodPhase::is_terminal);
    let life_ended = if tracking {
        observe_tracked_pod(ctx, namespace, &mut status, now).await?
    } else {
        false
    };

    if status.current_life >= total_lives {
        info!(lives = status.current_life, "Cat finished all its lives");
        status.phase = Some(CatPhase::Completed);
        persist_status(ctx, cat, namespace, name, status).await?;
        return Ok(Directive::Done);
    }

    if life_ended {
        if let Some(wait) = cooldown_remaining(&status, cooldown, now) {
            persist_status(ctx, cat, namespace, name, status).await?;
            return Ok(Directive::RequeueAfter(wait));
        }
    }

    let needs_pod = status.last_cat_pod_name.is_empty()
        || status.last_cat_pod_phase.map_or(true, PodPhase::is_terminal);
    if needs_pod {
        let spawned = spawn_life_pod(ctx, &cat, namespace, &mut status, &message).await;
        if let Err(e) = spawned {
            // The finished pod is already deleted; its outcome must not be lost
            if life_ended {
                persist_status(ctx, cat, namespace, name, status).await?;
            }
            return Err(e);
        }
    }

    status.phase = Some(CatPhase::Running);
    persist_status(ctx, cat, namespace, name, status).await?;
    Ok(Directive::Done)
}

async fn reconcile(cat: Arc<Cat>, ctx: Arc<ControllerContext>) -> Result<Action, CatError> {
    let name = cat
        .metadata
        .name
        .as_deref()
        .ok_or(CatError::MissingField("metadata.name"))?;
    let namespace = cat
        .metadata
        .namespace
        .as_deref()
        .ok_or(CatError::MissingField("metadata.namespace"))?;

    let directive = reconcile_cat(namespace, name, &ctx).await?;

    if let Some(uid) = cat.metadata.uid.as_deref() {
        ctx.retry_tracker.reset(uid);
    }

    Ok(directive.into())
}

fn retry_policy(error: &CatError) -> RetryPolicy {
    match error {
        CatError::PodCreate { .. } | CatError::PodDelete { .. } => {
            RetryPolicy::Fixed(POD_WRITE_RETRY)
        }
        CatError::MissingField(_) => RetryPolicy::AwaitChange,
        CatError::CatFetch(_)
        | CatError::InvalidDuration { .. }
        | CatError::PodFetch { .. }
        | CatError::StatusUpdate(_) => RetryPolicy::Backoff,
    }
}

fn error_policy(cat: Arc<Cat>, error: &CatError, ctx: Arc<ControllerContext>) -> Action {
    let uid = cat.metadata.uid.as_deref().unwrap_or("unknown");
    let policy = retry_policy(error);
    let attempt = ctx.retry_tracker.increment(uid);

    warn!(
        name = %cat.name_any(),
        namespace = %cat.namespace().unwrap_or_default(),
        error = %error,
        attempt = attempt,
        policy = ?policy,
        "Cat reconciliation failed"
    );

    compute_backoff(attempt, policy)
}

/// Start the Cat controller.
///
/// Watches Cats and the pods labelled as managed by this operator, in one
/// namespace or cluster-wide.
pub async fn run(client: Client, ctx: Arc<ControllerContext>, namespace: Option<String>) {
    let (cats, pods): (Api<Cat>, Api<Pod>) = match namespace.as_deref() {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    let managed_pods = format!("{}={}", labels::MANAGED_BY, labels::MANAGER);

    info!(
        namespace = namespace.as_deref().unwrap_or("*"),
        "Starting Cat controller"
    );

    Controller::new(cats, WatcherConfig::default())
        .watches(
            pods,
            WatcherConfig::default().labels(&managed_pods),
            |pod: Pod| owning_cat(&pod),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!(
                        name = %obj.name,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        "Cat reconciled"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "Cat controller error");
                }
            }
        })
        .await;
}
