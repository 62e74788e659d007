//! istio-operator - Istio multi-cluster trust bootstrap for k0rdent
//!
//! The operator watches KCM `ClusterDeployment`s carrying the Istio membership
//! label and, for each member cluster, maintains the artifacts a multi-primary
//! mesh needs on the management cluster.
//!
//! # Architecture
//!
//! - A remote secret holding a kubeconfig for the member's API server, built
//!   from a freshly minted service account token
//! - A cert-manager Certificate for the member's intermediate CA, issued from
//!   the shared root
//! - MultiClusterServices that copy the remote secret to every member and,
//!   for regional clusters, the CA secret to the member's region
//!
//! Remote secrets are rebuilt on a fixed interval so tokens never expire.
//!
//! # Modules
//!
//! - [`trigger`] - Cluster change notifications and per-cluster workers
//! - [`controller`] - Reconciliation of one cluster's artifacts
//! - [`remote_secret`] - Remote secret construction and lifecycle
//! - [`cert`] - Intermediate CA certificates
//! - [`propagation`] - MultiClusterService descriptors
//! - [`rotation`] - Periodic remote secret rotation
//! - [`region`] - Kubeconfig lookup across KCM regions
//! - [`naming`] - Deterministic artifact names
//! - [`crd`] - Models of the KCM and cert-manager resources we touch
//! - [`client`] - Management cluster access
//! - [`events`] - Kubernetes Event publishing
//! - [`retry`] - Backoff policies
//! - [`config`] - Operator configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod cert;
pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod naming;
pub mod propagation;
pub mod region;
pub mod remote_secret;
pub mod retry;
pub mod rotation;
pub mod trigger;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
