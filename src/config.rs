use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::kubernetes::AccessType;

const MIN_RESYNC_SECONDS: u64 = 10;

fn default_objects_resync_seconds() -> u64 {
    60
}

fn default_policies_resync_seconds() -> u64 {
    300
}

fn default_threadiness() -> usize {
    1
}

fn default_retries() -> u32 {
    5
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AzureAuthType {
    Default,
    Msi,
}

/// Controller configuration sourced from the environment. Accessors apply the
/// documented floors.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_objects_resync_seconds")]
    pub controller_objects_resync_seconds: u64,
    #[serde(default = "default_policies_resync_seconds")]
    pub controller_policies_resync_seconds: u64,
    #[serde(default = "default_threadiness")]
    pub controller_reconciler_threadiness: usize,
    #[serde(default = "default_threadiness")]
    pub controller_executor_threadiness: usize,
    #[serde(default = "default_retries")]
    pub controller_worker_queue_retries: u32,

    pub kube_access_type: AccessType,

    pub azure_auth_type: AzureAuthType,
    pub azure_subscription_id: String,
    /// Required for `default` auth.
    #[serde(default)]
    pub azure_tenant_id: Option<String>,
    /// Required for `default` auth.
    #[serde(default)]
    pub azure_client_id: Option<String>,
    /// Required for `default` auth.
    #[serde(default)]
    pub azure_client_secret: Option<SecretString>,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    pub fn objects_resync(&self) -> Duration {
        Duration::from_secs(self.controller_objects_resync_seconds.max(MIN_RESYNC_SECONDS))
    }

    pub fn policies_resync(&self) -> Duration {
        Duration::from_secs(self.controller_policies_resync_seconds.max(MIN_RESYNC_SECONDS))
    }

    pub fn reconciler_threadiness(&self) -> usize {
        self.controller_reconciler_threadiness.max(1)
    }

    pub fn executor_threadiness(&self) -> usize {
        self.controller_executor_threadiness.max(1)
    }

    pub fn worker_queue_retries(&self) -> u32 {
        self.controller_worker_queue_retries.max(1)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{AzureAuthType, Config};
    use crate::kubernetes::AccessType;

    #[test]
    fn accessors_apply_floors() {
        let config = Config {
            controller_objects_resync_seconds: 1,
            controller_policies_resync_seconds: 600,
            controller_reconciler_threadiness: 0,
            controller_executor_threadiness: 4,
            controller_worker_queue_retries: 0,
            kube_access_type: AccessType::External,
            azure_auth_type: AzureAuthType::Msi,
            azure_subscription_id: "sub".into(),
            azure_tenant_id: None,
            azure_client_id: None,
            azure_client_secret: None,
            http_port: 8080,
        };

        assert_eq!(config.objects_resync(), Duration::from_secs(10));
        assert_eq!(config.policies_resync(), Duration::from_secs(600));
        assert_eq!(config.reconciler_threadiness(), 1);
        assert_eq!(config.executor_threadiness(), 4);
        assert_eq!(config.worker_queue_retries(), 1);
    }
}
