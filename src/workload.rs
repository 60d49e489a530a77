use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::PodSpec;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::str::FromStr;

/// The closed set of workload kinds whose pod templates are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Deployment,
    DaemonSet,
    CronJob,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Deployment => "Deployment",
            ResourceType::DaemonSet => "DaemonSet",
            ResourceType::CronJob => "CronJob",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource type: {0}")]
pub struct UnknownResourceType(String);

impl FromStr for ResourceType {
    type Err = UnknownResourceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deployment" => Ok(ResourceType::Deployment),
            "DaemonSet" => Ok(ResourceType::DaemonSet),
            "CronJob" => Ok(ResourceType::CronJob),
            other => Err(UnknownResourceType(other.to_string())),
        }
    }
}

/// Identifies one named workload in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.resource_type, self.namespace, self.name)
    }
}

/// One container of a pod template, as far as image tracking is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub name: String,
    pub image: String,
}

/// Init containers followed by regular containers, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodTemplate {
    pub containers: Vec<ContainerImage>,
}

impl PodTemplate {
    pub fn from_pod_spec(spec: &PodSpec) -> Self {
        let init = spec.init_containers.iter().flatten();
        let containers = init
            .chain(spec.containers.iter())
            .map(|container| ContainerImage {
                name: container.name.clone(),
                image: container.image.clone().unwrap_or_default(),
            })
            .collect();
        Self { containers }
    }

    pub fn images(&self) -> Vec<&str> {
        self.containers.iter().map(|c| c.image.as_str()).collect()
    }

    pub fn find(&self, container_name: &str) -> Option<&ContainerImage> {
        self.containers.iter().find(|c| c.name == container_name)
    }
}

pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    const RESOURCE_TYPE: ResourceType;

    fn pod_spec(&self) -> Option<&PodSpec>;

    fn pod_template(&self) -> PodTemplate {
        self.pod_spec()
            .map(PodTemplate::from_pod_spec)
            .unwrap_or_default()
    }

    fn resource_key(&self) -> ResourceKey {
        ResourceKey {
            resource_type: Self::RESOURCE_TYPE,
            name: self.name_any(),
            namespace: self.namespace().unwrap_or_default(),
        }
    }
}

impl Workload for Deployment {
    const RESOURCE_TYPE: ResourceType = ResourceType::Deployment;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    const RESOURCE_TYPE: ResourceType = ResourceType::DaemonSet;

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for CronJob {
    const RESOURCE_TYPE: ResourceType = ResourceType::CronJob;

    //https://kubernetes.io/docs/reference/kubernetes-api/workload-resources/cron-job-v1/#CronJobSpec
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .and_then(|j| j.template.spec.as_ref())
    }
}
