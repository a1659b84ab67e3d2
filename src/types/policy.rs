use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const GROUP: &str = "automation.dodois.io";

/// Holds the pre-shutdown replica count as a decimal string. Present on
/// deployments and stateful sets only while they are scaled to zero by the
/// controller.
pub const RESTORE_REPLICAS_ANNOTATION: &str = "standschedule.automation.dodois.io/restore-replicas";

/// Schedule as cron plus an optional one-shot override (RFC3339 time string).
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    /// Cron format schedule, evaluated in UTC.
    #[serde(default)]
    pub cron: String,
    /// Absolute time overriding the next cron fire exactly once.
    #[serde(default, rename = "override")]
    pub override_time: String,
}

/// Schedules for both sides of the policy.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchedulesSpec {
    pub startup: CronSchedule,
    pub shutdown: CronSchedule,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AzureResourceKind {
    #[serde(rename = "mysql")]
    ManagedMySql,
    #[serde(rename = "vm")]
    VirtualMachine,
}

/// Filter selecting external cloud resources related to the stand.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AzureResourceFilter {
    /// One of the supported azure resource types.
    #[serde(rename = "type")]
    pub kind: AzureResourceKind,
    /// Resource group the resources live in.
    pub resource_group_name: String,
    /// Regex filter for resource names.
    pub resource_name_filter: String,
    /// Order in which resources are started or shut down.
    #[serde(default)]
    pub priority: i64,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesSpec {
    /// Related azure resources, stopped and started alongside the workloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub azure: Vec<AzureResourceFilter>,
}

/// StandSchedulePolicy declares startup/shutdown schedules for a stand: a set
/// of namespaces matched by regex plus related external resources.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug)]
#[kube(
    group = "automation.dodois.io",
    version = "v1",
    kind = "StandSchedulePolicy",
    plural = "standschedulepolicies",
    shortname = "sspol",
    status = "StandSchedulePolicyStatus",
    printcolumn = r#"{"name":"Startup","type":"string","jsonPath":".status.startup"}"#,
    printcolumn = r#"{"name":"Shutdown","type":"string","jsonPath":".status.shutdown"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StandSchedulePolicySpec {
    /// Regex filter matching namespaces to process. `|`-separated sub-patterns
    /// define the namespace processing order.
    pub target_namespace_filter: String,
    /// Schedules for both sides.
    pub schedules: SchedulesSpec,
    /// External resources to process.
    #[serde(default)]
    pub resources: ResourcesSpec,
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyConditionType {
    /// Side is armed and waiting for its fire time.
    Scheduled,
    /// Last execution finished and succeeded.
    Completed,
    /// Last execution finished and failed.
    Failed,
}

/// Side of a policy schedule.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleSide {
    Startup,
    Shutdown,
}

impl ScheduleSide {
    pub const BOTH: [ScheduleSide; 2] = [ScheduleSide::Startup, ScheduleSide::Shutdown];
}

impl fmt::Display for ScheduleSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatusCondition {
    /// Type of the condition.
    #[serde(rename = "type")]
    pub kind: PolicyConditionType,
    /// Side the condition refers to.
    pub status: ScheduleSide,
    /// Last time the condition transitioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Runtime data derived from the in-memory schedule states; never the source
/// of truth.
#[derive(Serialize, Deserialize, JsonSchema, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StandSchedulePolicyStatus {
    /// Current service state of the policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PolicyStatusCondition>,
    /// Human-readable startup summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup: Option<String>,
    /// Human-readable shutdown summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<String>,
}
