//! Kubernetes Event recording
//!
//! Events are attached to the ClusterDeployment being reconciled and are the
//! user-visible record of every artifact created or deleted and of every
//! failed step. Publishing is fire-and-forget: failures are logged and never
//! propagate into reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::crd::ClusterDeployment;
use crate::naming::ClusterKey;

/// Reporting component name on published Events
pub const CONTROLLER_NAME: &str = "istio-operator";

/// Trait for publishing Kubernetes Events.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given object.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Object reference for a live ClusterDeployment.
pub fn cluster_ref(cluster: &ClusterDeployment) -> ObjectReference {
    cluster.object_ref(&())
}

/// Object reference for a ClusterDeployment that may no longer exist.
pub fn cluster_stub_ref(key: &ClusterKey) -> ObjectReference {
    ObjectReference {
        api_version: Some(ClusterDeployment::api_version(&()).to_string()),
        kind: Some(ClusterDeployment::kind(&()).to_string()),
        name: Some(key.name.clone()),
        namespace: Some(key.namespace.clone()),
        ..Default::default()
    }
}

/// Generation of the object, or `nil` when the server has not set one.
pub fn generation_note(cluster: &ClusterDeployment) -> String {
    match cluster.meta().generation {
        Some(g) if g != 0 => format!("generation={g}"),
        _ => "generation=nil".to_string(),
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Remote secret written
    pub const SECRET_CREATED: &str = "SecretCreated";
    /// Remote secret removed
    pub const SECRET_DELETED: &str = "SecretDeleted";
    /// Remote secret could not be built or written
    pub const SECRET_CREATION_FAILED: &str = "SecretCreationFailed";
    /// Remote secret could not be removed
    pub const SECRET_DELETION_FAILED: &str = "SecretDeletionFailed";

    /// CA certificate request created
    pub const CERTIFICATE_CREATED: &str = "CertificateCreated";
    /// CA certificate request removed
    pub const CERTIFICATE_DELETED: &str = "CertificateDeleted";
    /// CA certificate (or its regional propagation) could not be created
    pub const ISTIO_CERT_CREATION_FAILED: &str = "IstioCertCreationFailed";
    /// CA certificate (or its regional propagation) could not be removed
    pub const ISTIO_CERT_DELETION_FAILED: &str = "IstioCertDeletionFailed";

    /// Propagation descriptor created
    pub const MULTI_CLUSTER_SERVICE_CREATED: &str = "MultiClusterServiceCreated";
    /// Propagation descriptor removed
    pub const MULTI_CLUSTER_SERVICE_DELETED: &str = "MultiClusterServiceDeleted";
    /// Propagation descriptor could not be created
    pub const MULTI_CLUSTER_SERVICE_CREATION_FAILED: &str = "MultiClusterServiceCreationFailed";
    /// Propagation descriptor could not be removed
    pub const MULTI_CLUSTER_SERVICE_DELETION_FAILED: &str = "MultiClusterServiceDeletionFailed";
}

/// Well-known event action strings.
pub mod actions {
    /// Artifact creation
    pub const CREATE: &str = "Create";
    /// Artifact deletion
    pub const DELETE: &str = "Delete";
    /// Remote secret rotation
    pub const ROTATE: &str = "Rotate";
}
