pub mod informer;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Namespace, Pod, ResourceQuota};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ErrorResponse;
use kube::runtime::reflector::{ObjectRef, Store};
use serde::Deserialize;

use crate::types::policy::{StandSchedulePolicy, StandSchedulePolicyStatus};

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Internal,
    External,
}

/// Builds a client for in-cluster or kubeconfig-based access.
pub async fn client_for_access_type(access_type: AccessType) -> anyhow::Result<kube::Client> {
    let config = match access_type {
        AccessType::Internal => kube::Config::incluster()?,
        AccessType::External => kube::Config::infer().await?,
    };
    Ok(config.try_into()?)
}

fn is_api_error(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(ErrorResponse { code: got, .. }) if *got == code)
}

pub fn ignore_already_exists<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(error) if is_api_error(&error, 409) => Ok(()),
        Err(error) => Err(error),
    }
}

pub fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), kube::Error> {
    match result {
        Ok(_) => Ok(()),
        Err(error) if is_api_error(&error, 404) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Cluster operations the executor drives. Namespace reads are cache-backed;
/// workload reads go straight to the API server so updates carry fresh
/// resource versions.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Names of the known namespaces, in lister order.
    fn namespace_names(&self) -> Vec<String>;
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, kube::Error>;
    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), kube::Error>;
    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error>;
    async fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), kube::Error>;
    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error>;
    async fn delete_resource_quota(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
    async fn delete_all_pods(&self, namespace: &str) -> Result<(), kube::Error>;
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, kube::Error>;
}

pub struct KubeCluster {
    client: kube::Client,
    namespaces: Store<Namespace>,
}

impl KubeCluster {
    pub fn new(client: kube::Client, namespaces: Store<Namespace>) -> Self {
        Self { client, namespaces }
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    fn namespace_names(&self) -> Vec<String> {
        self.namespaces
            .state()
            .iter()
            .filter_map(|namespace| namespace.metadata.name.clone())
            .collect()
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, kube::Error> {
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<(), kube::Error> {
        let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        let api = Api::<Deployment>::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), deployment).await?;
        Ok(())
    }

    async fn list_stateful_sets(&self, namespace: &str) -> Result<Vec<StatefulSet>, kube::Error> {
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), kube::Error> {
        let namespace = set.metadata.namespace.as_deref().unwrap_or_default();
        let name = set.metadata.name.as_deref().unwrap_or_default();
        let api = Api::<StatefulSet>::namespaced(self.client.clone(), namespace);
        api.replace(name, &PostParams::default(), set).await?;
        Ok(())
    }

    async fn create_resource_quota(
        &self,
        namespace: &str,
        quota: &ResourceQuota,
    ) -> Result<(), kube::Error> {
        let api = Api::<ResourceQuota>::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), quota).await?;
        Ok(())
    }

    async fn delete_resource_quota(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let api = Api::<ResourceQuota>::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_all_pods(&self, namespace: &str) -> Result<(), kube::Error> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        api.delete_collection(&DeleteParams::background(), &ListParams::default())
            .await?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, kube::Error> {
        let api = Api::<Pod>::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Read/write access to policy objects: cache-backed reads plus status
/// subresource writes.
#[async_trait]
pub trait PolicyApi: Send + Sync {
    fn get_cached(&self, name: &str) -> Option<Arc<StandSchedulePolicy>>;
    async fn update_status(
        &self,
        name: &str,
        status: &StandSchedulePolicyStatus,
    ) -> Result<(), kube::Error>;
}

pub struct PolicyClient {
    api: Api<StandSchedulePolicy>,
    store: Store<StandSchedulePolicy>,
}

impl PolicyClient {
    pub fn new(client: kube::Client, store: Store<StandSchedulePolicy>) -> Self {
        Self {
            api: Api::all(client),
            store,
        }
    }
}

#[async_trait]
impl PolicyApi for PolicyClient {
    fn get_cached(&self, name: &str) -> Option<Arc<StandSchedulePolicy>> {
        self.store.get(&ObjectRef::new(name))
    }

    async fn update_status(
        &self,
        name: &str,
        status: &StandSchedulePolicyStatus,
    ) -> Result<(), kube::Error> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ignore_already_exists, ignore_not_found};
    use crate::testing::api_error;

    #[test]
    fn idempotent_error_helpers() {
        assert!(ignore_already_exists::<()>(Err(api_error(409, "AlreadyExists"))).is_ok());
        assert!(ignore_already_exists::<()>(Err(api_error(404, "NotFound"))).is_err());
        assert!(ignore_not_found::<()>(Err(api_error(404, "NotFound"))).is_ok());
        assert!(ignore_not_found::<()>(Err(api_error(500, "InternalError"))).is_err());
    }
}
