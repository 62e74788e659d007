//! Kubeconfig lookup for member clusters
//!
//! Clusters created on the management cluster keep their kubeconfig secret
//! next to the ClusterDeployment. Clusters whose Credential names a secondary
//! region keep it on that region's cluster, which we first reach through the
//! kubeconfig the Region resource points at.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info};

use crate::client::ManagementApi;
use crate::config::MeshConfig;
use crate::crd::{ClusterDeployment, Credential, Region, SECRET_IDENTITY_KIND};
use crate::remote_secret::kubeconfig::BootstrapKubeconfig;
use crate::remote_secret::target::ClusterConnector;
use crate::{Error, Result};

/// Data key of kubeconfig secrets
pub const KUBECONFIG_VALUE_KEY: &str = "value";

/// Suffix of kubeconfig secrets for provisioned clusters
pub const KUBECONFIG_SECRET_SUFFIX: &str = "kubeconfig";

/// Suffix of kubeconfig secrets for adopted clusters without an identity reference
pub const ADOPTED_KUBECONFIG_SECRET_SUFFIX: &str = "kubeconf";

/// Bytes stored under `key`.
pub fn secret_data<'a>(secret: &'a Secret, key: &str) -> Result<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.as_slice())
        .ok_or_else(|| {
            Error::missing_data(format!(
                "secret {}/{} does not contain {key:?} key",
                secret.metadata.namespace.as_deref().unwrap_or_default(),
                secret.metadata.name.as_deref().unwrap_or_default()
            ))
        })
}

/// Locates the kubeconfig for a ClusterDeployment.
pub struct KubeconfigResolver {
    api: Arc<dyn ManagementApi>,
    connector: Arc<dyn ClusterConnector>,
    config: Arc<MeshConfig>,
}

impl KubeconfigResolver {
    /// Create a resolver
    pub fn new(
        api: Arc<dyn ManagementApi>,
        connector: Arc<dyn ClusterConnector>,
        config: Arc<MeshConfig>,
    ) -> Self {
        Self {
            api,
            connector,
            config,
        }
    }

    /// The cluster's Credential, looked up in the cluster namespace and then
    /// in the KCM namespace. `None` when the cluster names no credential.
    pub async fn credential(&self, cd: &ClusterDeployment) -> Result<Option<Credential>> {
        let name = cd.spec.credential.as_str();
        if name.is_empty() {
            return Ok(None);
        }
        let namespace = cd.key().namespace;
        if let Some(cred) = self.api.get_credential(name, &namespace).await? {
            return Ok(Some(cred));
        }
        if namespace != self.config.kcm_namespace {
            if let Some(cred) = self
                .api
                .get_credential(name, &self.config.kcm_namespace)
                .await?
            {
                return Ok(Some(cred));
            }
        }
        Err(Error::precondition(format!(
            "credential {name:?} not found in {namespace:?} or {:?}",
            self.config.kcm_namespace
        )))
    }

    /// Secondary region the cluster was created in, if any.
    pub async fn region_of(&self, cd: &ClusterDeployment) -> Result<Option<String>> {
        Ok(self
            .credential(cd)
            .await?
            .and_then(|c| c.region().map(str::to_string)))
    }

    /// Name of the secret holding the cluster's kubeconfig.
    pub fn kubeconfig_secret_name(
        cd: &ClusterDeployment,
        credential: Option<&Credential>,
    ) -> Result<String> {
        let name = cd.key().name;
        if !cd.is_adopted() {
            return Ok(format!("{name}-{KUBECONFIG_SECRET_SUFFIX}"));
        }
        match credential.and_then(|c| c.spec.identity_ref.as_ref()) {
            Some(identity) if identity.kind.as_deref() == Some(SECRET_IDENTITY_KIND) => {
                Ok(identity.name.clone())
            }
            Some(identity) => Err(Error::precondition(format!(
                "unsupported Credential IdentityRef kind {} for adopted cluster",
                identity.kind.as_deref().unwrap_or_default()
            ))),
            None => Ok(format!("{name}-{ADOPTED_KUBECONFIG_SECRET_SUFFIX}")),
        }
    }

    /// Bootstrap kubeconfig for the member cluster.
    pub async fn resolve(&self, cd: &ClusterDeployment) -> Result<BootstrapKubeconfig> {
        let key = cd.key();
        let credential = self.credential(cd).await?;
        let secret_name = Self::kubeconfig_secret_name(cd, credential.as_ref())?;

        let region = credential.as_ref().and_then(|c| c.region());
        let secret = match region {
            None => {
                debug!(cluster = %key, secret = %secret_name, "Reading kubeconfig from management cluster");
                self.api.get_secret(&secret_name, &key.namespace).await?
            }
            Some(region) => {
                info!(cluster = %key, region, secret = %secret_name, "Reading kubeconfig from regional cluster");
                let regional = self.region_kubeconfig(region).await?;
                let target = self.connector.connect(&regional).await?;
                target.get_secret(&secret_name, &key.namespace).await?
            }
        };

        let secret = secret.ok_or_else(|| {
            Error::missing_data(format!(
                "kubeconfig secret {}/{secret_name} not found",
                key.namespace
            ))
        })?;
        BootstrapKubeconfig::parse(secret_data(&secret, KUBECONFIG_VALUE_KEY)?)
    }

    /// Kubeconfig of a secondary region's cluster.
    async fn region_kubeconfig(&self, region_name: &str) -> Result<BootstrapKubeconfig> {
        let region: Region = self
            .api
            .get_region(region_name)
            .await?
            .ok_or_else(|| Error::precondition(format!("region {region_name:?} not found")))?;

        let (secret_name, namespace, key) = match (&region.spec.kube_config, &region.spec.cluster_deployment) {
            (Some(secret_ref), _) => (
                secret_ref.name.clone(),
                self.config.kcm_namespace.clone(),
                secret_ref
                    .key
                    .clone()
                    .filter(|k| !k.is_empty())
                    .unwrap_or_else(|| KUBECONFIG_VALUE_KEY.to_string()),
            ),
            (None, Some(cd_ref)) => (
                format!("{}-{KUBECONFIG_SECRET_SUFFIX}", cd_ref.name),
                cd_ref.namespace.clone(),
                KUBECONFIG_VALUE_KEY.to_string(),
            ),
            (None, None) => {
                return Err(Error::precondition(format!(
                    "region {region_name:?} has no kubeconfig"
                )))
            }
        };

        let secret = self
            .api
            .get_secret(&secret_name, &namespace)
            .await?
            .ok_or_else(|| {
                Error::missing_data(format!(
                    "region {region_name:?} kubeconfig secret {namespace}/{secret_name} not found"
                ))
            })?;
        BootstrapKubeconfig::parse(secret_data(&secret, &key)?)
    }
}
