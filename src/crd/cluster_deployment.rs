//! ClusterDeployment as seen by the operator
//!
//! KCM owns this resource; we only read the fields that drive mesh
//! membership, readiness and kubeconfig lookup.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::config::MeshConfig;
use crate::naming::ClusterKey;

/// Condition type reported on adopted clusters once they are reachable
pub const READY_CONDITION: &str = "Ready";

/// Condition type reported on provisioned clusters once a kubeconfig exists
pub const CAPI_CLUSTER_SUMMARY_CONDITION: &str = "CAPIClusterSummary";

/// Template prefix used for adopted (pre-existing) clusters
pub const ADOPTED_TEMPLATE_PREFIX: &str = "adopted-";

/// Specification for a ClusterDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "k0rdent.mirantis.com",
    version = "v1beta1",
    kind = "ClusterDeployment",
    plural = "clusterdeployments",
    shortname = "clusterd",
    status = "ClusterDeploymentStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentSpec {
    /// ClusterTemplate the cluster was created from
    #[serde(default)]
    pub template: String,

    /// Name of the Credential used to reach the infrastructure
    #[serde(default)]
    pub credential: String,

    /// Free-form template values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Status for a ClusterDeployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDeploymentStatus {
    /// Conditions reported by KCM
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ClusterDeployment {
    /// Identity of this cluster
    pub fn key(&self) -> ClusterKey {
        ClusterKey::new(self.name_any(), self.namespace().unwrap_or_default())
    }

    /// Adopted clusters are recognised by their template name prefix.
    pub fn is_adopted(&self) -> bool {
        self.spec.template.starts_with(ADOPTED_TEMPLATE_PREFIX)
    }

    /// True if a condition of the given type is present, whatever its status.
    pub fn has_condition(&self, type_: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.iter().any(|c| c.type_ == type_))
    }

    /// A cluster is ready once its access kubeconfig has been materialized.
    ///
    /// Only the presence of the condition is checked; upstream keeps some of
    /// these conditions `False` even after the kubeconfig exists.
    pub fn is_ready(&self) -> bool {
        if self.is_adopted() {
            self.has_condition(READY_CONDITION)
        } else {
            self.has_condition(CAPI_CLUSTER_SUMMARY_CONDITION)
        }
    }

    /// Value of the mesh isolation label, if any
    pub fn mesh<'a>(&'a self, config: &MeshConfig) -> Option<&'a str> {
        self.labels().get(&config.mesh_label).map(String::as_str)
    }

    /// True if the cluster is scoped to a named mesh
    pub fn is_in_mesh(&self, config: &MeshConfig) -> bool {
        self.mesh(config).is_some()
    }

    /// True if the membership label carries an accepted value
    pub fn is_mesh_member(&self, config: &MeshConfig) -> bool {
        is_member_labels(self.labels(), config)
    }
}

/// Membership check on a raw label map.
pub fn is_member_labels(labels: &BTreeMap<String, String>, config: &MeshConfig) -> bool {
    labels
        .get(&config.role_label)
        .is_some_and(|v| config.is_member_value(v))
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::config::{ISTIO_MESH_LABEL, ISTIO_ROLE_LABEL};
    use rstest::rstest;

    #[rstest]
    #[case::provisioned_with_summary("aws-standalone", &["CAPIClusterSummary"], true)]
    #[case::provisioned_ready_only("aws-standalone", &["Ready"], false)]
    #[case::provisioned_without_conditions("aws-standalone", &[], false)]
    #[case::adopted_ready("adopted-cluster-1-0-0", &["Ready"], true)]
    #[case::adopted_summary_only("adopted-cluster-1-0-0", &["CAPIClusterSummary"], false)]
    fn readiness_depends_on_cluster_origin(
        #[case] template: &str,
        #[case] conditions: &[&str],
        #[case] ready: bool,
    ) {
        let cd = cluster("c1", "ns1", template, &[], conditions);
        assert_eq!(cd.is_ready(), ready);
    }

    #[test]
    fn readiness_ignores_condition_status() {
        let mut cd = ready_member("c1", "ns1");
        if let Some(status) = cd.status.as_mut() {
            status.conditions[0].status = "False".to_string();
        }
        assert!(cd.is_ready());
    }

    #[test]
    fn missing_status_is_not_ready() {
        let mut cd = ready_member("c1", "ns1");
        cd.status = None;
        assert!(!cd.is_ready());
    }

    #[rstest]
    #[case::current("member", true)]
    #[case::legacy("child", true)]
    #[case::other("remote", false)]
    fn membership_from_role_label(#[case] role: &str, #[case] member: bool) {
        let cd = cluster("c1", "ns1", "t", &[(ISTIO_ROLE_LABEL, role)], &[]);
        assert_eq!(cd.is_mesh_member(&MeshConfig::default()), member);
    }

    #[test]
    fn mesh_label_is_optional() {
        let config = MeshConfig::default();
        let plain = ready_member("c1", "ns1");
        assert!(!plain.is_in_mesh(&config));

        let meshed = cluster("c1", "ns1", "t", &[(ISTIO_MESH_LABEL, "blue")], &[]);
        assert_eq!(meshed.mesh(&config), Some("blue"));
    }

    #[test]
    fn key_comes_from_metadata() {
        assert_eq!(ready_member("c1", "ns1").key(), ClusterKey::new("c1", "ns1"));
    }

    #[test]
    fn deserializes_kcm_object() {
        let json = serde_json::json!({
            "apiVersion": "k0rdent.mirantis.com/v1beta1",
            "kind": "ClusterDeployment",
            "metadata": {"name": "c1", "namespace": "ns1"},
            "spec": {"template": "adopted-cluster-1-0-0", "credential": "c1-cred", "dryRun": false},
            "status": {"conditions": [
                {"type": "Ready", "status": "False", "reason": "Pending", "message": "",
                 "lastTransitionTime": "2025-01-01T00:00:00Z"}
            ]}
        });
        let cd: ClusterDeployment = serde_json::from_value(json).expect("valid object");
        assert!(cd.is_adopted());
        assert!(cd.is_ready());
        assert_eq!(cd.spec.credential, "c1-cred");
    }
}
