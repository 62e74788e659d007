//! KCM Credential and Region resources
//!
//! A Credential names the identity a ClusterDeployment was created with. A
//! non-empty `region` means the cluster is managed by a regional control
//! plane, whose access is described by the cluster-scoped Region resource.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::ObjectRef;

/// Kind of identity reference that points at a kubeconfig Secret
pub const SECRET_IDENTITY_KIND: &str = "Secret";

/// Specification for a Credential
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k0rdent.mirantis.com",
    version = "v1beta1",
    kind = "Credential",
    plural = "credentials",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSpec {
    /// Identity object backing this credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_ref: Option<ObjectRef>,

    /// Region the credential belongs to; empty means the management cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Credential {
    /// Region name, if the credential is bound to a secondary region
    pub fn region(&self) -> Option<&str> {
        self.spec.region.as_deref().filter(|r| !r.is_empty())
    }
}

/// Reference to a key within a Secret in the KCM namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Secret name
    pub name: String,
    /// Key within the secret; `value` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Reference to the ClusterDeployment onboarded as a regional cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentRef {
    /// Namespace of the ClusterDeployment
    pub namespace: String,
    /// Name of the ClusterDeployment
    pub name: String,
}

/// Specification for a Region. Exactly one source of access is set.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k0rdent.mirantis.com",
    version = "v1beta1",
    kind = "Region",
    plural = "regions",
    shortname = "rgn"
)]
#[serde(rename_all = "camelCase")]
pub struct RegionSpec {
    /// Secret with the kubeconfig of the regional cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<SecretKeyReference>,

    /// ClusterDeployment that became the regional cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_deployment: Option<ClusterDeploymentRef>,
}
