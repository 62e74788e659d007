//! Remote secrets for member clusters
//!
//! A remote secret is a kubeconfig istiod uses to watch a member cluster's
//! API server. It is derived from the cluster's delegated kubeconfig by
//! minting a token for an in-cluster service account, then stored on the
//! management cluster in the Istio namespace.

pub mod builder;
pub mod kubeconfig;
pub mod target;
pub mod token;

use std::sync::Arc;

use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::client::ManagementApi;
use crate::config::MeshConfig;
use crate::crd::ClusterDeployment;
use crate::events::{
    actions, cluster_ref, cluster_stub_ref, generation_note, reasons, EventPublisher,
};
use crate::naming::{remote_secret_name, ClusterKey};
use crate::region::KubeconfigResolver;
use crate::Result;

pub use builder::{create_remote_secret, AuthMode, BuiltSecret, RemoteSecretOptions, SecretType};
pub use target::{ClusterConnector, KubeClusterConnector, TargetCluster};

/// Options for [`RemoteSecretManager::try_create`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Rebuild and replace an existing secret. An existing secret is rebuilt
    /// even while the cluster is unready; a missing one still waits for readiness.
    pub allow_overwrite: bool,
}

/// What [`RemoteSecretManager::try_create`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretOutcome {
    /// A new secret was written
    Created,
    /// An existing secret was rebuilt with a fresh token
    Rotated,
    /// The cluster has no reachable kubeconfig yet
    NotReady,
    /// The secret exists and overwriting was not requested
    AlreadyExists,
}

/// Creates and deletes remote secrets on the management cluster.
pub struct RemoteSecretManager {
    api: Arc<dyn ManagementApi>,
    connector: Arc<dyn ClusterConnector>,
    resolver: Arc<KubeconfigResolver>,
    events: Arc<dyn EventPublisher>,
    config: Arc<MeshConfig>,
    shutdown: CancellationToken,
}

impl RemoteSecretManager {
    /// Create a manager; `shutdown` abandons in-flight token waits.
    pub fn new(
        api: Arc<dyn ManagementApi>,
        connector: Arc<dyn ClusterConnector>,
        resolver: Arc<KubeconfigResolver>,
        events: Arc<dyn EventPublisher>,
        config: Arc<MeshConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            connector,
            resolver,
            events,
            config,
            shutdown,
        }
    }

    /// Build and store the remote secret for `cd`.
    #[instrument(skip(self, cd), fields(cluster = %cd.key(), overwrite = opts.allow_overwrite))]
    pub async fn try_create(
        &self,
        cd: &ClusterDeployment,
        opts: CreateOptions,
    ) -> Result<SecretOutcome> {
        let key = cd.key();
        let name = remote_secret_name(&key);
        let namespace = self.config.istio_namespace.as_str();

        if !opts.allow_overwrite {
            if !cd.is_ready() {
                info!("Cluster deployment is not ready");
                return Ok(SecretOutcome::NotReady);
            }
            if self.api.get_secret(&name, namespace).await?.is_some() {
                info!(secret = %name, "Remote secret already exists");
                return Ok(SecretOutcome::AlreadyExists);
            }
        } else if !cd.is_ready() && self.api.get_secret(&name, namespace).await?.is_none() {
            // overwrite refreshes an existing secret, it never creates the first one
            info!("Cluster deployment is not ready and has no remote secret to rotate");
            return Ok(SecretOutcome::NotReady);
        }

        let bootstrap = self.resolver.resolve(cd).await?;
        let target = self.connector.connect(&bootstrap).await?;
        let built = create_remote_secret(
            target.as_ref(),
            &bootstrap,
            &RemoteSecretOptions {
                allow_overwrite: opts.allow_overwrite,
                cancel: self.shutdown.clone(),
                ..RemoteSecretOptions::new(key.clone(), namespace)
            },
        )
        .await?;

        let replaced = self.api.delete_secret(&name, namespace).await?;
        self.api.create_secret(&built.secret).await?;

        let (outcome, action, verb) = if opts.allow_overwrite {
            (SecretOutcome::Rotated, actions::ROTATE, "rotated")
        } else {
            (SecretOutcome::Created, actions::CREATE, "created")
        };
        self.events
            .publish(
                &cluster_ref(cd),
                EventType::Normal,
                reasons::SECRET_CREATED,
                action,
                Some(format!(
                    "Istio remote secret '{name}' is successfully {verb} ({})",
                    generation_note(cd)
                )),
            )
            .await;
        info!(secret = %name, replaced, "Remote secret successfully {verb}");
        Ok(outcome)
    }

    /// Delete the remote secret for `key`; `false` if there was none.
    #[instrument(skip(self), fields(cluster = %key))]
    pub async fn try_delete(&self, key: &ClusterKey) -> Result<bool> {
        let name = remote_secret_name(key);
        if !self
            .api
            .delete_secret(&name, &self.config.istio_namespace)
            .await?
        {
            info!(secret = %name, "Remote secret already deleted");
            return Ok(false);
        }

        self.events
            .publish(
                &cluster_stub_ref(key),
                EventType::Normal,
                reasons::SECRET_DELETED,
                actions::DELETE,
                Some(format!("Istio remote secret '{name}' is successfully deleted")),
            )
            .await;
        info!(secret = %name, "Remote secret successfully deleted");
        Ok(true)
    }
}
