//! Resource definitions used by the operator
//!
//! None of these resources are owned by the operator: ClusterDeployment,
//! Credential, Region and MultiClusterService belong to KCM and Certificate
//! belongs to cert-manager. The models carry only the fields we read or write.

mod certificate;
mod cluster_deployment;
mod credential;
mod multicluster_service;
mod types;

pub use certificate::{
    Certificate, CertificatePrivateKey, CertificateSpec, IssuerRef, X509Subject,
    ECDSA_KEY_ALGORITHM,
};
pub use cluster_deployment::{
    is_member_labels, ClusterDeployment, ClusterDeploymentSpec, ClusterDeploymentStatus,
    ADOPTED_TEMPLATE_PREFIX, CAPI_CLUSTER_SUMMARY_CONDITION, READY_CONDITION,
};
pub use credential::{
    ClusterDeploymentRef, Credential, CredentialSpec, Region, RegionSpec, SecretKeyReference,
    SECRET_IDENTITY_KIND,
};
pub use multicluster_service::{
    MultiClusterService, MultiClusterServiceSpec, Service, ServiceSpec, TemplateResourceRef,
};
pub use types::{Condition, LabelSelector, ObjectRef};

#[cfg(test)]
pub(crate) use cluster_deployment::fixtures;
