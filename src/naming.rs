//! Deterministic names for every artifact derived from a cluster
//!
//! Each generated object name is a pure function of the cluster's
//! `(namespace, name)` pair and a purpose prefix, so repeated reconciles and
//! rotation always address the same objects.

use std::fmt;

/// Prefix for Istio remote secrets.
pub const REMOTE_SECRET_PREFIX: &str = "istio-remote-secret";
/// Prefix for the MultiClusterService that fans remote secrets out.
pub const REMOTE_SECRET_PROPAGATION_PREFIX: &str = "remote-secret-propagation";
/// Prefix for the MultiClusterService that fans CA secrets out to regions.
pub const CA_PROPAGATION_PREFIX: &str = "ca-cert-propagation";

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Identity of a member cluster: the `ClusterDeployment` name and namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    /// ClusterDeployment name
    pub name: String,
    /// ClusterDeployment namespace
    pub namespace: String,
}

impl ClusterKey {
    /// Create a key from name and namespace
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// `{namespace}-{name}`, the input to most name hashes
    fn qualified(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// 32-bit FNV-1a over the input bytes.
fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// `{prefix}-{fnv1a32(input) as lowercase hex}`
pub fn name_hash(prefix: &str, input: &str) -> String {
    format!("{}-{:x}", prefix, fnv1a32(input))
}

/// Name of the Istio remote secret for a cluster.
pub fn remote_secret_name(key: &ClusterKey) -> String {
    name_hash(REMOTE_SECRET_PREFIX, &key.qualified())
}

/// Name of the intermediate CA Certificate (and its secret) for a cluster.
pub fn cert_name(release_name: &str, key: &ClusterKey) -> String {
    format!("{}-{}-{}-ca", release_name, key.namespace, key.name)
}

/// Name of the MultiClusterService propagating a cluster's CA to its region.
pub fn cert_propagation_name(release_name: &str, key: &ClusterKey) -> String {
    name_hash(CA_PROPAGATION_PREFIX, &cert_name(release_name, key))
}

/// Name of the MultiClusterService propagating a cluster's remote secret.
pub fn remote_secret_propagation_name(key: &ClusterKey) -> String {
    name_hash(REMOTE_SECRET_PROPAGATION_PREFIX, &key.qualified())
}

/// Companion secret holding a requested service account token.
pub fn token_secret_name(service_account: &str) -> String {
    format!("{service_account}-istio-remote-secret-token")
}
