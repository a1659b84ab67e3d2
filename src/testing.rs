use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodStatus, ResourceQuota};
use kube::api::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use crate::azure::{CloudProvider, CloudResource, Error as CloudError, ResourceType};
use crate::kubernetes::{ClusterOps, PolicyApi};
use crate::types::policy::{
    AzureResourceFilter, CronSchedule, ResourcesSpec, SchedulesSpec, StandSchedulePolicy,
    StandSchedulePolicySpec, StandSchedulePolicyStatus, RESTORE_REPLICAS_ANNOTATION,
};

pub(crate) fn test_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 4, 10, 12, 0, 0).unwrap()
}

pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    })
}

pub(crate) fn policy(
    name: &str,
    filter: &str,
    schedules: SchedulesSpec,
    azure: Vec<AzureResourceFilter>,
) -> StandSchedulePolicy {
    let mut policy = StandSchedulePolicy::new(
        name,
        StandSchedulePolicySpec {
            target_namespace_filter: filter.to_string(),
            schedules,
            resources: ResourcesSpec { azure },
        },
    );
    policy.metadata.uid = Some(format!("uid-{name}"));
    policy.metadata.resource_version = Some("1".to_string());
    policy
}

pub(crate) fn policy_with_schedules(
    name: &str,
    filter: &str,
    startup_cron: &str,
    shutdown_cron: &str,
) -> StandSchedulePolicy {
    policy(
        name,
        filter,
        SchedulesSpec {
            startup: CronSchedule {
                cron: startup_cron.to_string(),
                override_time: String::new(),
            },
            shutdown: CronSchedule {
                cron: shutdown_cron.to_string(),
                override_time: String::new(),
            },
        },
        Vec::new(),
    )
}

pub(crate) fn deployment(
    namespace: &str,
    name: &str,
    replicas: i32,
    restore: Option<&str>,
) -> Deployment {
    let annotations = restore.map(|value| {
        [(RESTORE_REPLICAS_ANNOTATION.to_string(), value.to_string())]
            .into_iter()
            .collect()
    });
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations,
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn zero_quota(namespace: &str) -> ResourceQuota {
    ResourceQuota {
        metadata: ObjectMeta {
            name: Some(crate::executor::RESOURCE_QUOTA_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn running_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn in_namespace(meta: &ObjectMeta, namespace: &str) -> bool {
    meta.namespace.as_deref() == Some(namespace)
}

#[derive(Default)]
pub(crate) struct FakeClusterState {
    pub namespaces: Vec<String>,
    pub deployments: Vec<Deployment>,
    pub stateful_sets: Vec<StatefulSet>,
    pub pods: Vec<Pod>,
    pub quotas: Vec<ResourceQuota>,
    pub calls: Vec<String>,
}

/// In-memory cluster implementing the executor's facade.
#[derive(Default)]
pub(crate) struct FakeCluster {
    pub state: Mutex<FakeClusterState>,
}

impl FakeCluster {
    pub fn with_namespaces(namespaces: &[&str]) -> Self {
        let cluster = Self::default();
        cluster.state.lock().unwrap().namespaces =
            namespaces.iter().map(ToString::to_string).collect();
        cluster
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn quota_names(&self, namespace: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .quotas
            .iter()
            .filter(|quota| in_namespace(&quota.metadata, namespace))
            .filter_map(|quota| quota.metadata.name.clone())
            .collect()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .iter()
            .find(|d| in_namespace(&d.metadata, namespace) && d.metadata.name.as_deref() == Some(name))
            .cloned()
    }

    pub fn pod_count(&self, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|pod| in_namespace(&pod.metadata, namespace))
            .count()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    fn namespace_names(&self) -> Vec<String> {
        self.state.lock().unwrap().namespaces.clone()
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, kube::Error> {
        self.record(format!("list-deployments {namespace}"));
        let state = self.state.lock().unwrap();
        Ok(state
            .deployments
            .iter()
            .filter(|d| in_namespace(&d.metadata, namespace))
            .cloned()
            .collect())
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), kube::Error> {
        self.record(format!("update-deployment {}", deployment.name_any()));
        let mut state = self.state.lock().unwrap();
        for existing in state.deployments.iter_mut() {
            if existing.metadata.name == deployment.metadata.name
                && existing.metadata.namespace == deployment.metadata.namespace
            {
                *existing = deployment.clone();
                return Ok(());
            }
        }
        Err(api_error(404, "NotFound"))
    }

    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error> {
        self.record(format!("list-statefulsets {namespace}"));
        let state = self.state.lock().unwrap();
        Ok(state
            .stateful_sets
            .iter()
            .filter(|s| in_namespace(&s.metadata, namespace))
            .cloned()
            .collect())
    }

    async fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), kube::Error> {
        self.record(format!("update-statefulset {}", set.name_any()));
        let mut state = self.state.lock().unwrap();
        for existing in state.stateful_sets.iter_mut() {
            if existing.metadata.name == set.metadata.name
                && existing.metadata.namespace == set.metadata.namespace
            {
                *existing = set.clone();
                return Ok(());
            }
        }
        Err(api_error(404, "NotFound"))
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error> {
        self.record(format!("create-quota {namespace}"));
        let mut state = self.state.lock().unwrap();
        let exists = state
            .quotas
            .iter()
            .any(|q| in_namespace(&q.metadata, namespace) && q.metadata.name == quota.metadata.name);
        if exists {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.quotas.push(quota.clone());
        Ok(())
    }

    async fn delete_resource_quota(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        self.record(format!("delete-quota {namespace}"));
        let mut state = self.state.lock().unwrap();
        let before = state.quotas.len();
        state
            .quotas
            .retain(|q| !(in_namespace(&q.metadata, namespace) && q.metadata.name.as_deref() == Some(name)));
        if state.quotas.len() == before {
            return Err(api_error(404, "NotFound"));
        }
        Ok(())
    }

    async fn delete_all_pods(&self, namespace: &str) -> Result<(), kube::Error> {
        self.record(format!("delete-pods {namespace}"));
        let mut state = self.state.lock().unwrap();
        state.pods.retain(|pod| !in_namespace(&pod.metadata, namespace));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, kube::Error> {
        let state = self.state.lock().unwrap();
        Ok(state
            .pods
            .iter()
            .filter(|pod| in_namespace(&pod.metadata, namespace))
            .cloned()
            .collect())
    }
}

/// In-memory cloud recording the order of begin-stop/begin-start calls.
#[derive(Default)]
pub(crate) struct FakeCloud {
    pub resources: Mutex<Vec<CloudResource>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn with_resources(ids: &[&str]) -> Self {
        let cloud = Self::default();
        *cloud.resources.lock().unwrap() = ids
            .iter()
            .map(|id| CloudResource::parse(id).unwrap())
            .collect();
        cloud
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("stop") || call.starts_with("start"))
            .collect()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn list(
        &self,
        resource_type: ResourceType,
        resource_group: &str,
    ) -> Result<Vec<CloudResource>, CloudError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("list {} {}", resource_type.arm_type(), resource_group));
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.resource_type() == resource_type && r.resource_group() == resource_group)
            .cloned()
            .collect())
    }

    async fn stop(&self, resource: &CloudResource, _wait: bool) -> Result<(), CloudError> {
        self.calls.lock().unwrap().push(format!("stop {}", resource.name()));
        Ok(())
    }

    async fn start(&self, resource: &CloudResource, _wait: bool) -> Result<(), CloudError> {
        self.calls.lock().unwrap().push(format!("start {}", resource.name()));
        Ok(())
    }
}

/// Policy cache plus recorded status writes.
#[derive(Default)]
pub(crate) struct FakePolicies {
    items: Mutex<HashMap<String, Arc<StandSchedulePolicy>>>,
    statuses: Mutex<HashMap<String, StandSchedulePolicyStatus>>,
}

impl FakePolicies {
    pub fn put(&self, policy: &StandSchedulePolicy) {
        self.items
            .lock()
            .unwrap()
            .insert(policy.name_any(), Arc::new(policy.clone()));
    }

    pub fn remove(&self, name: &str) {
        self.items.lock().unwrap().remove(name);
    }

    pub fn status(&self, name: &str) -> Option<StandSchedulePolicyStatus> {
        self.statuses.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl PolicyApi for FakePolicies {
    fn get_cached(&self, name: &str) -> Option<Arc<StandSchedulePolicy>> {
        self.items.lock().unwrap().get(name).cloned()
    }

    async fn update_status(
        &self,
        name: &str,
        status: &StandSchedulePolicyStatus,
    ) -> Result<(), kube::Error> {
        self.statuses
            .lock()
            .unwrap()
            .insert(name.to_string(), status.clone());
        Ok(())
    }
}
