//! Access to the management cluster
//!
//! Every read and write the managers perform against the management cluster
//! goes through [`ManagementApi`]. Deletes report whether something was
//! actually removed and creates report whether something was actually
//! created, so callers can emit one event per real transition and treat
//! NotFound/AlreadyExists as success.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
#[cfg(test)]
use mockall::automock;

use crate::crd::{Certificate, ClusterDeployment, Credential, MultiClusterService, Region};
use crate::error::{is_already_exists, is_not_found};
use crate::naming::ClusterKey;
use crate::{Error, Result};

/// Default connect timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Store operations against the management cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Get a ClusterDeployment, `None` if it does not exist
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<ClusterDeployment>>;

    /// List ClusterDeployments carrying the given label key, any value
    async fn list_clusters_with_label(&self, label: &str) -> Result<Vec<ClusterDeployment>>;

    /// Get a Credential
    async fn get_credential(&self, name: &str, namespace: &str) -> Result<Option<Credential>>;

    /// Get a cluster-scoped Region
    async fn get_region(&self, name: &str) -> Result<Option<Region>>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;

    /// Create a Secret; fails if it already exists
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    /// Delete a Secret; `false` if it was already gone
    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool>;

    /// Get a Certificate
    async fn get_certificate(&self, name: &str, namespace: &str) -> Result<Option<Certificate>>;

    /// Create a Certificate; `false` if it already existed
    async fn create_certificate(&self, cert: &Certificate) -> Result<bool>;

    /// Delete a Certificate; `false` if it was already gone
    async fn delete_certificate(&self, name: &str, namespace: &str) -> Result<bool>;

    /// Get a cluster-scoped MultiClusterService
    async fn get_multicluster_service(&self, name: &str) -> Result<Option<MultiClusterService>>;

    /// Create a MultiClusterService; `false` if it already existed
    async fn create_multicluster_service(&self, mcs: &MultiClusterService) -> Result<bool>;

    /// Delete a MultiClusterService; `false` if it was already gone
    async fn delete_multicluster_service(&self, name: &str) -> Result<bool>;
}

/// [`ManagementApi`] backed by a kube [`Client`].
pub struct KubeManagementApi {
    client: Client,
}

impl KubeManagementApi {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a get result so that 404 becomes `None`.
pub(crate) fn optional<T>(result: std::result::Result<T, kube::Error>) -> Result<Option<T>> {
    match result {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Map a delete result so that 404 becomes `false`.
pub(crate) fn deleted<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Map a create result so that AlreadyExists becomes `false`.
pub(crate) fn created<T>(result: std::result::Result<T, kube::Error>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if is_already_exists(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ManagementApi for KubeManagementApi {
    async fn get_cluster(&self, key: &ClusterKey) -> Result<Option<ClusterDeployment>> {
        let api: Api<ClusterDeployment> = Api::namespaced(self.client.clone(), &key.namespace);
        optional(api.get(&key.name).await)
    }

    async fn list_clusters_with_label(&self, label: &str) -> Result<Vec<ClusterDeployment>> {
        let api: Api<ClusterDeployment> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default().labels(label)).await?;
        Ok(list.items)
    }

    async fn get_credential(&self, name: &str, namespace: &str) -> Result<Option<Credential>> {
        let api: Api<Credential> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_region(&self, name: &str) -> Result<Option<Region>> {
        let api: Api<Region> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str, namespace: &str) -> Result<bool> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_certificate(&self, name: &str, namespace: &str) -> Result<Option<Certificate>> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_certificate(&self, cert: &Certificate) -> Result<bool> {
        let namespace = cert.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        created(api.create(&PostParams::default(), cert).await)
    }

    async fn delete_certificate(&self, name: &str, namespace: &str) -> Result<bool> {
        let api: Api<Certificate> = Api::namespaced(self.client.clone(), namespace);
        deleted(api.delete(name, &DeleteParams::default()).await)
    }

    async fn get_multicluster_service(&self, name: &str) -> Result<Option<MultiClusterService>> {
        let api: Api<MultiClusterService> = Api::all(self.client.clone());
        optional(api.get(name).await)
    }

    async fn create_multicluster_service(&self, mcs: &MultiClusterService) -> Result<bool> {
        let api: Api<MultiClusterService> = Api::all(self.client.clone());
        created(api.create(&PostParams::default(), mcs).await)
    }

    async fn delete_multicluster_service(&self, name: &str) -> Result<bool> {
        let api: Api<MultiClusterService> = Api::all(self.client.clone());
        deleted(api.delete(name, &DeleteParams::default()).await)
    }
}

/// Create a kube client from an optional kubeconfig path, falling back to
/// in-cluster or default configuration.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::kubeconfig(format!("failed to read kubeconfig: {e}")))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::kubeconfig(format!("failed to load kubeconfig: {e}")))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::kubeconfig(format!("failed to infer config: {e}")))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))
}

/// Create a kube client from an in-memory kubeconfig document.
pub async fn client_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Client> {
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::kubeconfig(format!("failed to load kubeconfig: {e}")))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| Error::kubeconfig(format!("failed to create client: {e}")))
}
