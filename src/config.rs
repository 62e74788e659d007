//! Operator configuration
//!
//! Built once at startup and shared by `Arc` with every manager, so the
//! label conventions and namespaces are fixed for the life of the process.

use std::time::Duration;

/// Default namespace istiod and the generated secrets live in
pub const DEFAULT_ISTIO_NAMESPACE: &str = "istio-system";

/// Default helm release name of the Istio chart
pub const DEFAULT_RELEASE_NAME: &str = "k0rdent-istio";

/// Default namespace of the KCM control plane
pub const DEFAULT_KCM_NAMESPACE: &str = "kcm-system";

/// Label marking a ClusterDeployment as a mesh member
pub const ISTIO_ROLE_LABEL: &str = "k0rdent.mirantis.com/istio-role";

/// Current membership label value
pub const MEMBER_ROLE: &str = "member";

/// Deprecated membership label value, still accepted
pub const LEGACY_CHILD_ROLE: &str = "child";

/// Label partitioning clusters into independent meshes
pub const ISTIO_MESH_LABEL: &str = "k0rdent.mirantis.com/istio-mesh";

/// Label selecting KCM regional control-plane clusters
pub const KCM_REGION_CLUSTER_LABEL: &str = "k0rdent.mirantis.com/kcm-region-cluster";

/// Standard managed-by label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Our managed-by label value
pub const MANAGED_BY_VALUE: &str = "istio-operator";

/// Default interval between remote secret rotations
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Watcher timeout, must stay below the client read timeout
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 25;

/// Configuration shared by every component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshConfig {
    /// Namespace of istiod, remote secrets and CA certificates
    pub istio_namespace: String,
    /// Istio helm release name, used in certificate and template names
    pub release_name: String,
    /// Namespace of KCM (Credentials, region kubeconfig secrets)
    pub kcm_namespace: String,
    /// Membership label key
    pub role_label: String,
    /// Canonical membership value, used in propagation selectors
    pub member_value: String,
    /// Additional membership values that are still honoured
    pub legacy_member_values: Vec<String>,
    /// Mesh isolation label key
    pub mesh_label: String,
    /// Interval between rotation cycles
    pub rotation_interval: Duration,
    /// Server-side watch timeout in seconds
    pub watch_timeout_secs: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            istio_namespace: DEFAULT_ISTIO_NAMESPACE.to_string(),
            release_name: DEFAULT_RELEASE_NAME.to_string(),
            kcm_namespace: DEFAULT_KCM_NAMESPACE.to_string(),
            role_label: ISTIO_ROLE_LABEL.to_string(),
            member_value: MEMBER_ROLE.to_string(),
            legacy_member_values: vec![LEGACY_CHILD_ROLE.to_string()],
            mesh_label: ISTIO_MESH_LABEL.to_string(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }
}

impl MeshConfig {
    /// True if `value` is an accepted membership label value.
    pub fn is_member_value(&self, value: &str) -> bool {
        value == self.member_value || self.legacy_member_values.iter().any(|v| v == value)
    }

    /// Name of the shared root issuer every cluster CA chains to.
    pub fn root_issuer_name(&self) -> String {
        format!("{}-root", self.release_name)
    }

    /// Name of the template that copies secrets onto target clusters.
    pub fn propagation_template_name(&self) -> String {
        format!("{}-base-propagation", self.release_name)
    }
}
