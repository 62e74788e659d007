//! KCM MultiClusterService: declarative fan-out of services to clusters
//!
//! The operator uses it to copy a secret (remote secret or CA) onto every
//! cluster matched by `clusterSelector`, through a propagation template that
//! reads the referenced object.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{LabelSelector, ObjectRef};

/// Specification for a MultiClusterService
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k0rdent.mirantis.com",
    version = "v1beta1",
    kind = "MultiClusterService",
    plural = "multiclusterservices",
    shortname = "mcs"
)]
#[serde(rename_all = "camelCase")]
pub struct MultiClusterServiceSpec {
    /// Clusters the services are deployed onto
    #[serde(default)]
    pub cluster_selector: LabelSelector,

    /// Services and the objects their templates read
    #[serde(default)]
    pub service_spec: ServiceSpec,
}

/// Services deployed by a MultiClusterService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Services to deploy
    #[serde(default)]
    pub services: Vec<Service>,

    /// Objects exposed to the service templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub template_resource_refs: Vec<TemplateResourceRef>,
}

/// A templated service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Release name on the target cluster
    pub name: String,
    /// Target namespace
    pub namespace: String,
    /// ServiceTemplate name
    pub template: String,
}

/// Object made available to templates under `identifier`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateResourceRef {
    /// Name the template uses to look the object up
    pub identifier: String,
    /// The referenced object
    pub resource: ObjectRef,
}
