//! Propagation of secrets to member clusters
//!
//! A MultiClusterService instantiates the shared propagation template on every
//! cluster its selector matches, handing the template one secret from the
//! management cluster. One is created per member cluster for its remote
//! secret, and the certificate manager creates another for regional CA copies.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{info, instrument};

use crate::client::ManagementApi;
use crate::config::{MeshConfig, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{
    ClusterDeployment, LabelSelector, MultiClusterService, MultiClusterServiceSpec, ObjectRef,
    Service, ServiceSpec, TemplateResourceRef,
};
use crate::events::{
    actions, cluster_ref, cluster_stub_ref, generation_note, reasons, EventPublisher,
};
use crate::naming::{remote_secret_name, remote_secret_propagation_name, ClusterKey};
use crate::Result;

/// Name of the service instantiated on target clusters
pub const PROPAGATION_SERVICE_NAME: &str = "istio-secret-propagation";

/// Label recording the source cluster's name
pub const CLUSTER_NAME_LABEL: &str = "cluster-name";

/// Label recording the source cluster's namespace
pub const CLUSTER_NAMESPACE_LABEL: &str = "cluster-namespace";

/// Template identifier for a propagated remote secret
pub const SECRET_IDENTIFIER: &str = "Secret";

/// Template identifier for a propagated CA secret
pub const DATA_IDENTIFIER: &str = "Data";

/// What a propagation MultiClusterService copies, and where to.
#[derive(Clone, Debug)]
pub struct PropagationTarget<'a> {
    /// MultiClusterService name
    pub name: String,
    /// Cluster the propagated secret belongs to
    pub source: &'a ClusterKey,
    /// Clusters receiving the secret
    pub selector: LabelSelector,
    /// Name the template reads the secret under
    pub identifier: &'a str,
    /// Secret in the Istio namespace to copy
    pub secret_name: String,
}

/// Build a MultiClusterService copying one secret to the selected clusters.
pub fn propagation_service(config: &MeshConfig, target: PropagationTarget<'_>) -> MultiClusterService {
    MultiClusterService {
        metadata: ObjectMeta {
            name: Some(target.name),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                (CLUSTER_NAME_LABEL.to_string(), target.source.name.clone()),
                (
                    CLUSTER_NAMESPACE_LABEL.to_string(),
                    target.source.namespace.clone(),
                ),
            ])),
            ..Default::default()
        },
        spec: MultiClusterServiceSpec {
            cluster_selector: target.selector,
            service_spec: ServiceSpec {
                services: vec![Service {
                    name: PROPAGATION_SERVICE_NAME.to_string(),
                    namespace: config.istio_namespace.clone(),
                    template: config.propagation_template_name(),
                }],
                template_resource_refs: vec![TemplateResourceRef {
                    identifier: target.identifier.to_string(),
                    resource: ObjectRef::secret(target.secret_name, config.istio_namespace.clone()),
                }],
            },
        },
    }
}

/// MultiClusterService copying a cluster's remote secret to every mesh member.
pub fn remote_secret_propagation(config: &MeshConfig, key: &ClusterKey) -> MultiClusterService {
    propagation_service(
        config,
        PropagationTarget {
            name: remote_secret_propagation_name(key),
            source: key,
            selector: LabelSelector::from_pairs([(
                config.role_label.as_str(),
                config.member_value.as_str(),
            )]),
            identifier: SECRET_IDENTIFIER,
            secret_name: remote_secret_name(key),
        },
    )
}

/// Creates and deletes the remote secret propagation descriptor.
pub struct PropagationManager {
    api: Arc<dyn ManagementApi>,
    events: Arc<dyn EventPublisher>,
    config: Arc<MeshConfig>,
}

impl PropagationManager {
    /// Create a manager
    pub fn new(
        api: Arc<dyn ManagementApi>,
        events: Arc<dyn EventPublisher>,
        config: Arc<MeshConfig>,
    ) -> Self {
        Self {
            api,
            events,
            config,
        }
    }

    /// Ensure the propagation descriptor for `cd` exists; `true` if it was created now.
    ///
    /// Unready clusters are skipped until their remote secret can exist.
    #[instrument(skip(self, cd), fields(cluster = %cd.key()))]
    pub async fn try_create(&self, cd: &ClusterDeployment) -> Result<bool> {
        if !cd.is_ready() {
            info!("Cluster deployment is not ready");
            return Ok(false);
        }

        let key = cd.key();
        let name = remote_secret_propagation_name(&key);

        if self.api.get_multicluster_service(&name).await?.is_some() {
            info!(mcs = %name, "MultiClusterService already exists");
            return Ok(false);
        }

        let mcs = remote_secret_propagation(&self.config, &key);
        if !self.api.create_multicluster_service(&mcs).await? {
            info!(mcs = %name, "MultiClusterService created concurrently");
            return Ok(false);
        }

        self.events
            .publish(
                &cluster_ref(cd),
                EventType::Normal,
                reasons::MULTI_CLUSTER_SERVICE_CREATED,
                actions::CREATE,
                Some(format!(
                    "MultiClusterService '{name}' for secret propagation is successfully created ({})",
                    generation_note(cd)
                )),
            )
            .await;
        info!(mcs = %name, "MultiClusterService successfully created");
        Ok(true)
    }

    /// Delete the propagation descriptor for `key`; `false` if there was none.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn try_delete(&self, key: &ClusterKey) -> Result<bool> {
        let name = remote_secret_propagation_name(key);
        if !self.api.delete_multicluster_service(&name).await? {
            info!(mcs = %name, "MultiClusterService already deleted");
            return Ok(false);
        }

        self.events
            .publish(
                &cluster_stub_ref(key),
                EventType::Normal,
                reasons::MULTI_CLUSTER_SERVICE_DELETED,
                actions::DELETE,
                Some(format!(
                    "MultiClusterService '{name}' for secret propagation is successfully deleted"
                )),
            )
            .await;
        info!(mcs = %name, "MultiClusterService successfully deleted");
        Ok(true)
    }
}
