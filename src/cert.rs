//! Per-cluster intermediate CA
//!
//! Every member cluster gets its own Istio CA, issued by cert-manager from the
//! shared root issuer so that all meshes chain to a common trust anchor.
//! Clusters managed by a secondary KCM region additionally need the CA secret
//! copied onto the regional clusters of their mesh.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{debug, info, instrument};

use crate::client::ManagementApi;
use crate::config::{MeshConfig, KCM_REGION_CLUSTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{
    Certificate, CertificatePrivateKey, CertificateSpec, ClusterDeployment, IssuerRef,
    LabelSelector, MultiClusterService, X509Subject, ECDSA_KEY_ALGORITHM,
};
use crate::events::{
    actions, cluster_ref, cluster_stub_ref, generation_note, reasons, EventPublisher,
};
use crate::naming::{cert_name, cert_propagation_name, ClusterKey};
use crate::propagation::{propagation_service, PropagationTarget, DATA_IDENTIFIER};
use crate::region::KubeconfigResolver;
use crate::Result;

/// ECDSA curve size of cluster CA keys
pub const CA_KEY_SIZE: u32 = 521;

/// Subject organization of cluster CAs
pub const CA_ORGANIZATION: &str = "Istio";

/// Kind of the root issuer
pub const ISSUER_KIND: &str = "Issuer";

/// API group of the root issuer
pub const ISSUER_GROUP: &str = "cert-manager.io";

/// Build the CA Certificate request for a cluster.
pub fn certificate_for(config: &MeshConfig, key: &ClusterKey) -> Certificate {
    let name = cert_name(&config.release_name, key);
    Certificate {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.istio_namespace.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        spec: CertificateSpec {
            is_ca: true,
            common_name: Some(format!("{} CA", key.name)),
            subject: Some(X509Subject {
                organizations: vec![CA_ORGANIZATION.to_string()],
            }),
            private_key: Some(CertificatePrivateKey {
                algorithm: Some(ECDSA_KEY_ALGORITHM.to_string()),
                size: Some(CA_KEY_SIZE),
            }),
            secret_name: name,
            issuer_ref: IssuerRef {
                name: config.root_issuer_name(),
                kind: Some(ISSUER_KIND.to_string()),
                group: Some(ISSUER_GROUP.to_string()),
            },
        },
    }
}

/// MultiClusterService copying a cluster's CA secret to the regional clusters of its mesh.
pub fn ca_propagation(config: &MeshConfig, key: &ClusterKey, mesh: &str) -> MultiClusterService {
    propagation_service(
        config,
        PropagationTarget {
            name: cert_propagation_name(&config.release_name, key),
            source: key,
            selector: LabelSelector::from_pairs([
                (config.mesh_label.as_str(), mesh),
                (KCM_REGION_CLUSTER_LABEL, "true"),
            ]),
            identifier: DATA_IDENTIFIER,
            secret_name: cert_name(&config.release_name, key),
        },
    )
}

/// Creates and deletes cluster CA certificates.
pub struct CertManager {
    api: Arc<dyn ManagementApi>,
    resolver: Arc<KubeconfigResolver>,
    events: Arc<dyn EventPublisher>,
    config: Arc<MeshConfig>,
}

impl CertManager {
    /// Create a manager
    pub fn new(
        api: Arc<dyn ManagementApi>,
        resolver: Arc<KubeconfigResolver>,
        events: Arc<dyn EventPublisher>,
        config: Arc<MeshConfig>,
    ) -> Self {
        Self {
            api,
            resolver,
            events,
            config,
        }
    }

    /// Ensure the CA certificate exists, plus its regional copy where needed.
    #[instrument(skip(self, cd), fields(cluster = %cd.key()))]
    pub async fn try_create(&self, cd: &ClusterDeployment) -> Result<()> {
        let key = cd.key();
        let cert = certificate_for(&self.config, &key);
        let name = cert.metadata.name.clone().unwrap_or_default();

        let namespace = self.config.istio_namespace.as_str();
        if self.api.get_certificate(&name, namespace).await?.is_some() {
            debug!(certificate = %name, "Istio CA certificate already exists");
        } else if self.api.create_certificate(&cert).await? {
            self.events
                .publish(
                    &cluster_ref(cd),
                    EventType::Normal,
                    reasons::CERTIFICATE_CREATED,
                    actions::CREATE,
                    Some(format!(
                        "Istio certificate '{name}' is successfully created ({})",
                        generation_note(cd)
                    )),
                )
                .await;
            info!(certificate = %name, "Istio CA certificate created");
        } else {
            debug!(certificate = %name, "Istio CA certificate created concurrently");
        }

        if !cd.is_ready() {
            info!("Cluster deployment is not ready");
            return Ok(());
        }
        let Some(mesh) = cd.mesh(&self.config) else {
            return Ok(());
        };
        if self.resolver.region_of(cd).await?.is_none() {
            return Ok(());
        }

        let mcs = ca_propagation(&self.config, &key, mesh);
        let mcs_name = mcs.metadata.name.as_deref().unwrap_or_default();
        if self.api.get_multicluster_service(mcs_name).await?.is_some() {
            debug!(mcs = %mcs_name, "MultiClusterService for regional CA propagation already exists");
        } else if self.api.create_multicluster_service(&mcs).await? {
            info!(mcs = %mcs_name, "MultiClusterService for regional CA propagation created");
        }
        Ok(())
    }

    /// Delete the CA certificate and its regional copy; `true` if the certificate existed.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn try_delete(&self, key: &ClusterKey) -> Result<bool> {
        let name = cert_name(&self.config.release_name, key);
        let deleted = self
            .api
            .delete_certificate(&name, &self.config.istio_namespace)
            .await?;
        if !deleted {
            info!(certificate = %name, "Istio certificate already deleted");
        }

        let mcs = cert_propagation_name(&self.config.release_name, key);
        if !self.api.delete_multicluster_service(&mcs).await? {
            debug!(mcs = %mcs, "MultiClusterService for certificate propagation already deleted");
        }

        if deleted {
            self.events
                .publish(
                    &cluster_stub_ref(key),
                    EventType::Normal,
                    reasons::CERTIFICATE_DELETED,
                    actions::DELETE,
                    Some(format!("Istio certificate '{name}' is successfully deleted")),
                )
                .await;
            info!(certificate = %name, "Istio certificate successfully deleted");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockManagementApi;
    use crate::config::ISTIO_MESH_LABEL;
    use crate::crd::fixtures::{cluster, pending_member, ready_member};
    use crate::crd::{Credential, CredentialSpec, CAPI_CLUSTER_SUMMARY_CONDITION};
    use crate::events::MockEventPublisher;
    use crate::remote_secret::target::MockClusterConnector;
    use std::sync::Mutex;

    fn manager(api: MockManagementApi, events: MockEventPublisher) -> CertManager {
        let api: Arc<dyn ManagementApi> = Arc::new(api);
        let config = Arc::new(MeshConfig {
            release_name: "rel".to_string(),
            ..Default::default()
        });
        let resolver = Arc::new(KubeconfigResolver::new(
            api.clone(),
            Arc::new(MockClusterConnector::new()),
            config.clone(),
        ));
        CertManager::new(api, resolver, Arc::new(events), config)
    }

    fn existing(name: &str) -> Certificate {
        let mut cert = certificate_for(
            &MeshConfig {
                release_name: "rel".to_string(),
                ..Default::default()
            },
            &ClusterKey::new("c1", "ns1"),
        );
        cert.metadata.name = Some(name.to_string());
        cert
    }

    fn regional_mesh_member() -> ClusterDeployment {
        cluster(
            "c1",
            "ns1",
            "aws-standalone-cp-1-0-0",
            &[
                (crate::config::ISTIO_ROLE_LABEL, "member"),
                (ISTIO_MESH_LABEL, "blue"),
            ],
            &[CAPI_CLUSTER_SUMMARY_CONDITION],
        )
    }

    fn credential_in(
        region: Option<&'static str>,
    ) -> impl Fn(&str, &str) -> Result<Option<Credential>> + Send + 'static {
        move |name, _| {
            Ok(Some(Credential::new(
                name,
                CredentialSpec {
                    region: region.map(str::to_string),
                    ..Default::default()
                },
            )))
        }
    }

    #[test]
    fn story_certificate_request_matches_istio_ca_layout() {
        let config = MeshConfig {
            release_name: "rel".to_string(),
            ..Default::default()
        };
        let cert = certificate_for(&config, &ClusterKey::new("c1", "ns1"));

        assert_eq!(cert.metadata.name.as_deref(), Some("rel-ns1-c1-ca"));
        assert_eq!(cert.metadata.namespace.as_deref(), Some("istio-system"));
        assert_eq!(
            cert.metadata.labels.as_ref().expect("labels")[MANAGED_BY_LABEL],
            "istio-operator"
        );
        assert!(cert.spec.is_ca);
        assert_eq!(cert.spec.common_name.as_deref(), Some("c1 CA"));
        assert_eq!(cert.spec.secret_name, "rel-ns1-c1-ca");
        assert_eq!(
            cert.spec.subject.as_ref().map(|s| s.organizations.clone()),
            Some(vec!["Istio".to_string()])
        );
        assert_eq!(
            cert.spec.private_key,
            Some(CertificatePrivateKey {
                algorithm: Some("ECDSA".to_string()),
                size: Some(521),
            })
        );
        assert_eq!(cert.spec.issuer_ref.name, "rel-root");
        assert_eq!(cert.spec.issuer_ref.kind.as_deref(), Some("Issuer"));
        assert_eq!(cert.spec.issuer_ref.group.as_deref(), Some("cert-manager.io"));
    }

    #[test]
    fn ca_propagation_targets_regional_clusters_of_the_mesh() {
        let config = MeshConfig {
            release_name: "rel".to_string(),
            ..Default::default()
        };
        let key = ClusterKey::new("c1", "ns1");
        let mcs = ca_propagation(&config, &key, "blue");

        assert_eq!(
            mcs.metadata.name.as_deref(),
            Some(cert_propagation_name("rel", &key).as_str())
        );
        assert_eq!(
            mcs.spec.cluster_selector.match_labels,
            BTreeMap::from([
                (ISTIO_MESH_LABEL.to_string(), "blue".to_string()),
                (KCM_REGION_CLUSTER_LABEL.to_string(), "true".to_string()),
            ])
        );
        let reference = &mcs.spec.service_spec.template_resource_refs[0];
        assert_eq!(reference.identifier, "Data");
        assert_eq!(reference.resource.name, "rel-ns1-c1-ca");
        assert_eq!(mcs.spec.service_spec.services[0].template, "rel-base-propagation");
    }

    #[tokio::test]
    async fn story_new_certificate_emits_event() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate()
            .withf(|name, ns| name == "rel-ns1-c1-ca" && ns == "istio-system")
            .returning(|_, _| Ok(None));
        api.expect_create_certificate()
            .withf(|c| c.metadata.name.as_deref() == Some("rel-ns1-c1-ca"))
            .times(1)
            .returning(|_| Ok(true));
        // not in a mesh, so no region lookup and no CA propagation
        api.expect_get_credential().never();
        api.expect_create_multicluster_service().never();

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, note| {
                reason == reasons::CERTIFICATE_CREATED
                    && note
                        .as_deref()
                        .is_some_and(|n| n.contains("rel-ns1-c1-ca") && n.contains("generation=1"))
            })
            .times(1)
            .returning(|_, _, _, _, _| ());

        manager(api, events)
            .try_create(&ready_member("c1", "ns1"))
            .await
            .expect("created");
    }

    #[tokio::test]
    async fn story_existing_certificate_is_not_posted_again() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate()
            .returning(|name, _| Ok(Some(existing(name))));
        api.expect_create_certificate().never();
        let mut events = MockEventPublisher::new();
        events.expect_publish().never();

        manager(api, events)
            .try_create(&pending_member("c1", "ns1"))
            .await
            .expect("already exists is fine");
    }

    #[tokio::test]
    async fn lost_create_race_is_success_without_event() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate().returning(|_, _| Ok(None));
        api.expect_create_certificate().returning(|_| Ok(false));
        let mut events = MockEventPublisher::new();
        events.expect_publish().never();

        manager(api, events)
            .try_create(&pending_member("c1", "ns1"))
            .await
            .expect("already exists is fine");
    }

    #[tokio::test]
    async fn story_repeated_passes_create_the_certificate_once() {
        let stored: Arc<Mutex<Option<Certificate>>> = Arc::default();
        let mut api = MockManagementApi::new();
        {
            let stored = stored.clone();
            api.expect_get_certificate()
                .times(2)
                .returning(move |_, _| Ok(stored.lock().unwrap().clone()));
        }
        {
            let stored = stored.clone();
            api.expect_create_certificate()
                .times(1)
                .returning(move |cert| {
                    *stored.lock().unwrap() = Some(cert.clone());
                    Ok(true)
                });
        }
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _, _| ());

        let manager = manager(api, events);
        for _ in 0..2 {
            manager
                .try_create(&ready_member("c1", "ns1"))
                .await
                .expect("ensured");
        }
    }

    #[tokio::test]
    async fn story_regional_mesh_member_gets_ca_propagation() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate()
            .returning(|name, _| Ok(Some(existing(name))));
        api.expect_get_credential().returning(credential_in(Some("eu")));
        api.expect_get_multicluster_service()
            .withf(|name| name == cert_propagation_name("rel", &ClusterKey::new("c1", "ns1")))
            .returning(|_| Ok(None));
        api.expect_create_multicluster_service()
            .withf(|m| {
                m.spec
                    .service_spec
                    .template_resource_refs
                    .first()
                    .map(|r| r.identifier.as_str())
                    == Some("Data")
            })
            .times(1)
            .returning(|_| Ok(true));

        manager(api, MockEventPublisher::new())
            .try_create(&regional_mesh_member())
            .await
            .expect("created");
    }

    #[tokio::test]
    async fn mesh_member_on_management_cluster_needs_no_ca_propagation() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate()
            .returning(|name, _| Ok(Some(existing(name))));
        api.expect_get_credential().returning(credential_in(None));
        api.expect_create_multicluster_service().never();

        manager(api, MockEventPublisher::new())
            .try_create(&regional_mesh_member())
            .await
            .expect("created");
    }

    #[tokio::test]
    async fn certificate_create_failure_propagates() {
        let mut api = MockManagementApi::new();
        api.expect_get_certificate().returning(|_, _| Ok(None));
        api.expect_create_certificate()
            .returning(|_| Err(crate::error::test_support::unavailable().into()));

        assert!(manager(api, MockEventPublisher::new())
            .try_create(&ready_member("c1", "ns1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn story_delete_removes_certificate_then_propagation() {
        let mut seq = mockall::Sequence::new();
        let mut api = MockManagementApi::new();
        api.expect_delete_certificate()
            .withf(|name, ns| name == "rel-ns1-c1-ca" && ns == "istio-system")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        api.expect_delete_multicluster_service()
            .withf(|name| name == cert_propagation_name("rel", &ClusterKey::new("c1", "ns1")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));

        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, _, reason, _, _| reason == reasons::CERTIFICATE_DELETED)
            .times(1)
            .returning(|_, _, _, _, _| ());

        assert!(manager(api, events)
            .try_delete(&ClusterKey::new("c1", "ns1"))
            .await
            .expect("deleted"));
    }

    #[tokio::test]
    async fn delete_of_missing_certificate_still_cleans_propagation() {
        let mut api = MockManagementApi::new();
        api.expect_delete_certificate().returning(|_, _| Ok(false));
        api.expect_delete_multicluster_service()
            .times(1)
            .returning(|_| Ok(true));
        let mut events = MockEventPublisher::new();
        events.expect_publish().never();

        assert!(!manager(api, events)
            .try_delete(&ClusterKey::new("c1", "ns1"))
            .await
            .expect("already gone"));
    }
}
