//! Cat CRD: a workload that lives a bounded number of times

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Cat resource
pub const GROUP: &str = "example.cats.io";
/// API version of the Cat resource
pub const VERSION: &str = "v1alpha1";
/// Kind of the Cat resource
pub const KIND: &str = "Cat";

/// Cooldown between two lives when `spec.duration` is omitted
pub const DEFAULT_DURATION: &str = "5s";
/// What a cat says when `spec.message` is omitted
pub const DEFAULT_MESSAGE: &str = "hello, world!";
/// Number of lives when `spec.totalLives` is omitted
pub const DEFAULT_TOTAL_LIVES: i32 = 9;

/// Cat spec - how many lives, what to say, and how long to rest between lives
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "example.cats.io",
    version = "v1alpha1",
    kind = "Cat",
    plural = "cats",
    namespaced = true,
    status = "CatStatus",
    printcolumn = r#"{"name":"Lives", "type":"integer", "jsonPath":".spec.totalLives"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.currentLife"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CatSpec {
    /// Total number of times a cat pod will be created. Default is 9.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub total_lives: Option<i32>,
    /// What the cat says. Default is "hello, world!"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(length(max = 128))]
    pub message: Option<String>,
    /// Cooldown between the end of one life and the start of the next. Default is 5s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Observed state of a Cat
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CatStatus {
    /// Name of the last pod created for this cat
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_cat_pod_name: String,
    /// When the last pod reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cat_pod_finished_time: Option<DateTime<Utc>>,
    /// Last observed phase of the last pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_cat_pod_phase: Option<PodPhase>,
    /// Lifecycle phase; absent until the first life starts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<CatPhase>,
    /// Human-readable description of the current phase
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Number of lives completed so far
    #[serde(default)]
    pub current_life: i32,
}

/// Lifecycle phase of a Cat
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum CatPhase {
    /// A life is in progress or about to start
    #[serde(rename = "Alive")]
    Running,
    /// All lives are done; terminal
    Completed,
    /// The last pod failed; the loop keeps going
    Error,
}

/// Pod phase as recorded in the Cat status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Whether a pod in this phase will never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PodPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(PodPhase::Pending),
            "Running" => Ok(PodPhase::Running),
            "Succeeded" => Ok(PodPhase::Succeeded),
            "Failed" => Ok(PodPhase::Failed),
            "Unknown" => Ok(PodPhase::Unknown),
            other => Err(format!("unknown pod phase: {other}")),
        }
    }
}

impl Cat {
    /// Deterministic pod name for the given life
    pub fn life_pod_name(&self, life: i32) -> String {
        format!("{}-life-{}", self.name_any(), life)
    }

    /// `apiVersion` string used in owner references and admission responses
    pub fn api_version() -> String {
        format!("{GROUP}/{VERSION}")
    }
}
