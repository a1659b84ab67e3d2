pub mod client;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::policy::AzureResourceKind;

pub use client::AzureClient;

/// Supported ARM resource types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    ManagedMySql,
    VirtualMachine,
}

impl ResourceType {
    /// `provider/type` pair as it appears in ARM resource ids.
    pub fn arm_type(&self) -> &'static str {
        match self {
            Self::ManagedMySql => "Microsoft.DBforMySQL/servers",
            Self::VirtualMachine => "Microsoft.Compute/virtualMachines",
        }
    }

    fn api_version(&self) -> &'static str {
        match self {
            Self::ManagedMySql => "2017-12-01",
            Self::VirtualMachine => "2023-03-01",
        }
    }
}

impl From<AzureResourceKind> for ResourceType {
    fn from(kind: AzureResourceKind) -> Self {
        match kind {
            AzureResourceKind::ManagedMySql => Self::ManagedMySql,
            AzureResourceKind::VirtualMachine => Self::VirtualMachine,
        }
    }
}

/// Single ARM resource, parsed from its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudResource {
    id: String,
    resource_group: String,
    resource_type: ResourceType,
    name: String,
}

impl CloudResource {
    /// Parses `/subscriptions/{id}/resourceGroups/{group}/providers/{provider}/{type}/{name}`.
    pub fn parse(id: &str) -> Result<Self, Error> {
        let segments: Vec<&str> = id.trim_start_matches('/').split('/').collect();
        let &[subscriptions, _, resource_groups, group, providers, provider, kind, name] =
            segments.as_slice()
        else {
            return Err(Error::InvalidResourceId(id.to_string()));
        };
        if !subscriptions.eq_ignore_ascii_case("subscriptions")
            || !resource_groups.eq_ignore_ascii_case("resourceGroups")
            || !providers.eq_ignore_ascii_case("providers")
        {
            return Err(Error::InvalidResourceId(id.to_string()));
        }

        let arm_type = format!("{}/{}", provider, kind);
        let resource_type = match arm_type.as_str() {
            "Microsoft.DBforMySQL/servers" => ResourceType::ManagedMySql,
            "Microsoft.Compute/virtualMachines" => ResourceType::VirtualMachine,
            _ => return Err(Error::UnsupportedType(arm_type)),
        };

        Ok(Self {
            id: id.to_string(),
            resource_group: group.to_string(),
            resource_type,
            name: name.to_string(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_group(&self) -> &str {
        &self.resource_group
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }
}

impl fmt::Display for CloudResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.resource_type.arm_type(),
            self.resource_group,
            self.name
        )
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid resource id {0:?}")]
    InvalidResourceId(String),
    #[error("unsupported resource type {0:?}")]
    UnsupportedType(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("cloud api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("cloud api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("cloud operation finished with status {0:?}")]
    Operation(String),
}

/// Capability set the executor drives cloud resources through; one
/// implementation per vendor, resource-type dispatch inside.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn list(
        &self,
        resource_type: ResourceType,
        resource_group: &str,
    ) -> Result<Vec<CloudResource>, Error>;
    /// Begins stopping the resource; with `wait`, polls the operation to
    /// completion.
    async fn stop(&self, resource: &CloudResource, wait: bool) -> Result<(), Error>;
    /// Begins starting the resource; with `wait`, polls the operation to
    /// completion.
    async fn start(&self, resource: &CloudResource, wait: bool) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::{CloudResource, ResourceType};

    #[test]
    fn parses_arm_resource_ids() {
        let resource = CloudResource::parse(
            "/subscriptions/11111111-2222-3333-4444-555555555555/resourceGroups/test/providers/Microsoft.DBforMySQL/servers/test-mysql-aa-suffix",
        )
        .unwrap();

        assert_eq!(resource.resource_type(), ResourceType::ManagedMySql);
        assert_eq!(resource.resource_group(), "test");
        assert_eq!(resource.name(), "test-mysql-aa-suffix");
        assert_eq!(
            resource.to_string(),
            "Microsoft.DBforMySQL/servers/test/test-mysql-aa-suffix"
        );
    }

    #[test]
    fn rejects_malformed_and_unknown_ids() {
        assert!(CloudResource::parse("/subscriptions/1/resourceGroups/test").is_err());
        assert!(CloudResource::parse(
            "/subscriptions/1/resourceGroups/test/providers/Microsoft.Storage/storageAccounts/acc"
        )
        .is_err());
    }
}
