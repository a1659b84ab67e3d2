use std::time::Duration;

use k8s_openapi::api::core::v1::{Pod, ResourceQuota, ResourceQuotaSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::Resource;

use super::{algs, Error, ExecutorContext, RESOURCE_QUOTA_NAME};
use crate::clock::chrono_duration;
use crate::kubernetes::{ignore_already_exists, ignore_not_found};
use crate::types::policy::{StandSchedulePolicy, RESTORE_REPLICAS_ANNOTATION};

const TERMINATE_POLL: Duration = Duration::from_secs(15);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(60);
const PENDING_POLL: Duration = Duration::from_secs(15);
const STATEFUL_SET_START_TIMEOUT: Duration = Duration::from_secs(180);
const DEPLOYMENT_START_TIMEOUT: Duration = Duration::from_secs(60);

fn collect(errors: &mut Vec<Error>, result: Result<(), Error>) {
    match result {
        Ok(()) => {}
        Err(Error::Multiple(mut nested)) => errors.append(&mut nested),
        Err(error) => errors.push(error),
    }
}

pub(super) async fn shutdown(
    ctx: &ExecutorContext,
    policy: &StandSchedulePolicy,
) -> Result<(), Error> {
    let namespaces = target_namespaces(ctx, policy, false)?;
    let mut errors = Vec::new();
    for namespace in &namespaces {
        collect(&mut errors, scale_down_workloads(ctx, namespace).await);
        collect(&mut errors, create_zero_quota(ctx, namespace, policy).await);
        collect(&mut errors, delete_pods(ctx, namespace).await);
        collect(&mut errors, wait_pods_terminated(ctx, namespace).await);
    }
    Error::combine(errors)
}

pub(super) async fn startup(
    ctx: &ExecutorContext,
    policy: &StandSchedulePolicy,
) -> Result<(), Error> {
    let namespaces = target_namespaces(ctx, policy, true)?;
    let mut errors = Vec::new();
    for namespace in &namespaces {
        collect(&mut errors, delete_zero_quota(ctx, namespace).await);
        collect(&mut errors, restore_stateful_sets(ctx, namespace).await);
        collect(
            &mut errors,
            wait_pods_scheduled(ctx, namespace, STATEFUL_SET_START_TIMEOUT).await,
        );
        collect(&mut errors, restore_deployments(ctx, namespace).await);
        collect(
            &mut errors,
            wait_pods_scheduled(ctx, namespace, DEPLOYMENT_START_TIMEOUT).await,
        );
    }
    Error::combine(errors)
}

fn target_namespaces(
    ctx: &ExecutorContext,
    policy: &StandSchedulePolicy,
    reverse: bool,
) -> Result<Vec<String>, Error> {
    let known = ctx.cluster.namespace_names();
    algs::sort_namespaces(&known, &policy.spec.target_namespace_filter, reverse)
}

/// Saves the current replica count into the reserved annotation and scales
/// non-zero deployments and stateful sets to zero.
async fn scale_down_workloads(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    tracing::debug!(%namespace, "scale down deployments and stateful sets in namespace");
    let mut errors = Vec::new();

    for mut deployment in ctx.cluster.list_deployments(namespace).await? {
        let Some(replicas) = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .filter(|replicas| *replicas != 0)
        else {
            continue;
        };
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(0);
        }
        deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RESTORE_REPLICAS_ANNOTATION.to_string(), replicas.to_string());
        if let Err(error) = ctx.cluster.update_deployment(&deployment).await {
            errors.push(error.into());
        }
    }

    for mut set in ctx.cluster.list_stateful_sets(namespace).await? {
        let Some(replicas) = set
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .filter(|replicas| *replicas != 0)
        else {
            continue;
        };
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(0);
        }
        set.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(RESTORE_REPLICAS_ANNOTATION.to_string(), replicas.to_string());
        if let Err(error) = ctx.cluster.update_stateful_set(&set).await {
            errors.push(error.into());
        }
    }

    Error::combine(errors)
}

async fn create_zero_quota(
    ctx: &ExecutorContext,
    namespace: &str,
    policy: &StandSchedulePolicy,
) -> Result<(), Error> {
    tracing::debug!(quota = RESOURCE_QUOTA_NAME, %namespace, "create resource quota in namespace");
    let owner = policy
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    let quota = ResourceQuota {
        metadata: ObjectMeta {
            name: Some(RESOURCE_QUOTA_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ResourceQuotaSpec {
            hard: Some([("pods".to_string(), Quantity("0".to_string()))].into()),
            ..Default::default()
        }),
        ..Default::default()
    };
    Ok(ignore_already_exists(
        ctx.cluster.create_resource_quota(namespace, &quota).await,
    )?)
}

async fn delete_zero_quota(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    tracing::debug!(quota = RESOURCE_QUOTA_NAME, %namespace, "delete resource quota in namespace");
    Ok(ignore_not_found(
        ctx.cluster
            .delete_resource_quota(namespace, RESOURCE_QUOTA_NAME)
            .await,
    )?)
}

async fn delete_pods(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    tracing::debug!(%namespace, "delete all existing pods in namespace");
    Ok(ctx.cluster.delete_all_pods(namespace).await?)
}

fn pod_terminated(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().all(|container| {
                container
                    .state
                    .as_ref()
                    .map(|state| state.terminated.is_some())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(true)
}

fn pod_pending(pod: &Pod) -> bool {
    pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Pending")
}

async fn wait_pods_terminated(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    let deadline = ctx.clock.now() + chrono_duration(TERMINATE_TIMEOUT);
    loop {
        let pods = ctx.cluster.list_pods(namespace).await?;
        if pods.iter().all(pod_terminated) {
            return Ok(());
        }
        if ctx.clock.now() >= deadline {
            tracing::warn!(%namespace, "timed out waiting for pods to terminate");
            return Ok(());
        }
        ctx.clock.sleep(TERMINATE_POLL).await;
    }
}

async fn wait_pods_scheduled(
    ctx: &ExecutorContext,
    namespace: &str,
    timeout: Duration,
) -> Result<(), Error> {
    let deadline = ctx.clock.now() + chrono_duration(timeout);
    loop {
        let pods = ctx.cluster.list_pods(namespace).await?;
        let pending = pods.iter().filter(|pod| pod_pending(pod)).count();
        if pending == 0 {
            return Ok(());
        }
        if ctx.clock.now() >= deadline {
            tracing::warn!(%namespace, pending, "timed out waiting for pods to leave pending phase");
            return Ok(());
        }
        ctx.clock.sleep(PENDING_POLL).await;
    }
}

/// Restores replicas saved in the reserved annotation on zero-replica
/// stateful sets and clears the annotation.
async fn restore_stateful_sets(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    tracing::debug!(%namespace, "scale up stateful sets in namespace");
    let mut errors = Vec::new();

    for mut set in ctx.cluster.list_stateful_sets(namespace).await? {
        if set.spec.as_ref().and_then(|spec| spec.replicas) != Some(0) {
            continue;
        }
        let Some(saved) = set
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(RESTORE_REPLICAS_ANNOTATION))
            .cloned()
        else {
            continue;
        };
        let Ok(replicas) = saved.parse::<i32>() else {
            errors.push(Error::InvalidReplicasAnnotation {
                name: set.metadata.name.clone().unwrap_or_default(),
                value: saved,
            });
            continue;
        };
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        if let Some(annotations) = set.metadata.annotations.as_mut() {
            annotations.remove(RESTORE_REPLICAS_ANNOTATION);
        }
        if let Err(error) = ctx.cluster.update_stateful_set(&set).await {
            errors.push(error.into());
        }
    }

    Error::combine(errors)
}

async fn restore_deployments(ctx: &ExecutorContext, namespace: &str) -> Result<(), Error> {
    tracing::debug!(%namespace, "scale up deployments in namespace");
    let mut errors = Vec::new();

    for mut deployment in ctx.cluster.list_deployments(namespace).await? {
        if deployment.spec.as_ref().and_then(|spec| spec.replicas) != Some(0) {
            continue;
        }
        let Some(saved) = deployment
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(RESTORE_REPLICAS_ANNOTATION))
            .cloned()
        else {
            continue;
        };
        let Ok(replicas) = saved.parse::<i32>() else {
            errors.push(Error::InvalidReplicasAnnotation {
                name: deployment.metadata.name.clone().unwrap_or_default(),
                value: saved,
            });
            continue;
        };
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        if let Some(annotations) = deployment.metadata.annotations.as_mut() {
            annotations.remove(RESTORE_REPLICAS_ANNOTATION);
        }
        if let Err(error) = ctx.cluster.update_deployment(&deployment).await {
            errors.push(error.into());
        }
    }

    Error::combine(errors)
}
