//! Access to a member (or regional) cluster through a delegated kubeconfig

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use super::kubeconfig::BootstrapKubeconfig;
use crate::client::{client_from_kubeconfig, optional};
use crate::{Error, Result};

/// Operations the credential builder performs on the target cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TargetCluster: Send + Sync {
    /// Minor version reported by the API server (`"24+"` parses as 24)
    async fn minor_version(&self) -> Result<u32>;

    /// Get a ServiceAccount
    async fn get_service_account(&self, name: &str, namespace: &str)
        -> Result<Option<ServiceAccount>>;

    /// Get a Secret
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>>;

    /// Create a Secret
    async fn create_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Replace an existing Secret
    async fn replace_secret(&self, secret: &Secret) -> Result<Secret>;

    /// Request a bound token for a ServiceAccount
    async fn request_token(
        &self,
        service_account: &str,
        namespace: &str,
        expiration_seconds: i64,
    ) -> Result<String>;
}

/// Builds [`TargetCluster`] handles from kubeconfigs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the cluster described by `kubeconfig`
    async fn connect(&self, kubeconfig: &BootstrapKubeconfig) -> Result<Arc<dyn TargetCluster>>;
}

/// Parse the minor component of a Kubernetes version (`"27"`, `"27+"`).
pub fn parse_minor(minor: &str) -> Option<u32> {
    let digits: String = minor.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// [`TargetCluster`] backed by a kube [`Client`].
pub struct KubeTargetCluster {
    client: Client,
}

impl KubeTargetCluster {
    /// Wrap a client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TargetCluster for KubeTargetCluster {
    async fn minor_version(&self) -> Result<u32> {
        let info = self.client.apiserver_version().await?;
        if info.major.trim_end_matches('+') != "1" {
            return Err(Error::unsupported(format!(
                "kubernetes major version {}",
                info.major
            )));
        }
        parse_minor(&info.minor)
            .ok_or_else(|| Error::unsupported(format!("kubernetes minor version {}", info.minor)))
    }

    async fn get_service_account(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceAccount>> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        optional(api.get(name).await)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<Secret> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or("default");
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.replace(name, &PostParams::default(), secret).await?)
    }

    async fn request_token(
        &self,
        service_account: &str,
        namespace: &str,
        expiration_seconds: i64,
    ) -> Result<String> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let request = TokenRequest {
            spec: TokenRequestSpec {
                audiences: Vec::new(),
                expiration_seconds: Some(expiration_seconds),
                ..Default::default()
            },
            ..Default::default()
        };
        let response = api
            .create_token_request(service_account, &PostParams::default(), &request)
            .await?;
        response
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                Error::missing_data(format!(
                    "token request for service account {namespace}/{service_account} returned no token"
                ))
            })
    }
}

/// [`ClusterConnector`] building real kube clients.
pub struct KubeClusterConnector;

#[async_trait]
impl ClusterConnector for KubeClusterConnector {
    async fn connect(&self, kubeconfig: &BootstrapKubeconfig) -> Result<Arc<dyn TargetCluster>> {
        let client = client_from_kubeconfig(kubeconfig.kubeconfig().clone()).await?;
        Ok(Arc::new(KubeTargetCluster::new(client)))
    }
}
