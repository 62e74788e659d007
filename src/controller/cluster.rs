//! Reconciliation of one member cluster's trust artifacts

use std::sync::Arc;

use kube::runtime::events::EventType;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cert::CertManager;
use crate::client::{KubeManagementApi, ManagementApi};
use crate::config::MeshConfig;
use crate::crd::ClusterDeployment;
use crate::events::{
    actions, cluster_ref, cluster_stub_ref, generation_note, reasons, EventPublisher,
    KubeEventPublisher, CONTROLLER_NAME,
};
use crate::naming::{
    cert_name, remote_secret_name, remote_secret_propagation_name, ClusterKey,
};
use crate::propagation::PropagationManager;
use crate::region::KubeconfigResolver;
use crate::remote_secret::{
    ClusterConnector, CreateOptions, KubeClusterConnector, RemoteSecretManager,
};
use crate::{Error, Result};

/// Shared state for reconciliation and rotation
///
/// Built once at startup and shared by `Arc` with every worker:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(mesh_config)
///     .build();
/// ```
pub struct Context {
    /// Management cluster store
    pub api: Arc<dyn ManagementApi>,
    /// Remote secret lifecycle
    pub remote_secrets: RemoteSecretManager,
    /// CA certificate lifecycle
    pub certs: CertManager,
    /// Remote secret propagation lifecycle
    pub propagation: PropagationManager,
    /// Event sink for failures
    pub events: Arc<dyn EventPublisher>,
    /// Operator configuration
    pub config: Arc<MeshConfig>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Wire the managers around the given seams.
    fn assemble(
        api: Arc<dyn ManagementApi>,
        connector: Arc<dyn ClusterConnector>,
        events: Arc<dyn EventPublisher>,
        config: Arc<MeshConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        let resolver = Arc::new(KubeconfigResolver::new(
            api.clone(),
            connector.clone(),
            config.clone(),
        ));
        Self {
            remote_secrets: RemoteSecretManager::new(
                api.clone(),
                connector,
                resolver.clone(),
                events.clone(),
                config.clone(),
                shutdown,
            ),
            certs: CertManager::new(api.clone(), resolver, events.clone(), config.clone()),
            propagation: PropagationManager::new(api.clone(), events.clone(), config.clone()),
            api,
            events,
            config,
        }
    }

    /// Create a context for testing with custom seams
    #[cfg(test)]
    pub fn for_testing(
        api: Arc<dyn ManagementApi>,
        connector: Arc<dyn ClusterConnector>,
        events: Arc<dyn EventPublisher>,
        config: MeshConfig,
    ) -> Self {
        Self::assemble(api, connector, events, Arc::new(config), CancellationToken::new())
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: MeshConfig,
    api: Option<Arc<dyn ManagementApi>>,
    connector: Option<Arc<dyn ClusterConnector>>,
    events: Option<Arc<dyn EventPublisher>>,
    shutdown: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            config: MeshConfig::default(),
            api: None,
            connector: None,
            events: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Set the operator configuration
    pub fn config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the management cluster store
    pub fn management_api(mut self, api: Arc<dyn ManagementApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Override how member clusters are reached
    pub fn connector(mut self, connector: Arc<dyn ClusterConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Override the event sink
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Token that abandons in-flight waits on member clusters at shutdown
    pub fn shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let api = self
            .api
            .unwrap_or_else(|| Arc::new(KubeManagementApi::new(self.client.clone())));
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(KubeClusterConnector));
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(self.client.clone(), CONTROLLER_NAME))
        });
        Context::assemble(api, connector, events, Arc::new(self.config), self.shutdown)
    }
}

/// What a reconcile pass did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The cluster exists and its artifacts are in place
    Applied,
    /// The cluster is gone and its artifacts were removed
    Cleaned,
}

/// Bring the artifacts of one cluster in line with its current state.
///
/// A present cluster gets its remote secret, CA certificate and propagation
/// descriptor, in that order. A missing cluster has all three removed. The
/// first failing step emits a Warning event naming the artifact and stops the
/// pass; the caller retries with backoff.
#[instrument(skip(ctx), fields(cluster = %key))]
pub async fn reconcile(key: &ClusterKey, ctx: &Context) -> Result<ReconcileOutcome> {
    match ctx.api.get_cluster(key).await? {
        Some(cd) => {
            create_artifacts(&cd, ctx).await?;
            Ok(ReconcileOutcome::Applied)
        }
        None => {
            delete_artifacts(key, ctx).await?;
            Ok(ReconcileOutcome::Cleaned)
        }
    }
}

async fn create_artifacts(cd: &ClusterDeployment, ctx: &Context) -> Result<()> {
    let key = cd.key();
    info!("Reconciling cluster deployment");

    if let Err(e) = ctx
        .remote_secrets
        .try_create(cd, CreateOptions::default())
        .await
    {
        let name = remote_secret_name(&key);
        report_create_failure(ctx, cd, reasons::SECRET_CREATION_FAILED, "remote secret", &name, &e)
            .await;
        return Err(e);
    }

    if let Err(e) = ctx.certs.try_create(cd).await {
        let name = cert_name(&ctx.config.release_name, &key);
        report_create_failure(
            ctx,
            cd,
            reasons::ISTIO_CERT_CREATION_FAILED,
            "Istio certificate",
            &name,
            &e,
        )
        .await;
        return Err(e);
    }

    if let Err(e) = ctx.propagation.try_create(cd).await {
        let name = remote_secret_propagation_name(&key);
        report_create_failure(
            ctx,
            cd,
            reasons::MULTI_CLUSTER_SERVICE_CREATION_FAILED,
            "MultiClusterService",
            &name,
            &e,
        )
        .await;
        return Err(e);
    }

    Ok(())
}

async fn delete_artifacts(key: &ClusterKey, ctx: &Context) -> Result<()> {
    info!("Cluster deployment not found, removing its artifacts");

    if let Err(e) = ctx.remote_secrets.try_delete(key).await {
        let name = remote_secret_name(key);
        report_delete_failure(ctx, key, reasons::SECRET_DELETION_FAILED, "remote secret", &name, &e)
            .await;
        return Err(e);
    }

    if let Err(e) = ctx.certs.try_delete(key).await {
        let name = cert_name(&ctx.config.release_name, key);
        report_delete_failure(
            ctx,
            key,
            reasons::ISTIO_CERT_DELETION_FAILED,
            "Istio certificate",
            &name,
            &e,
        )
        .await;
        return Err(e);
    }

    if let Err(e) = ctx.propagation.try_delete(key).await {
        let name = remote_secret_propagation_name(key);
        report_delete_failure(
            ctx,
            key,
            reasons::MULTI_CLUSTER_SERVICE_DELETION_FAILED,
            "MultiClusterService",
            &name,
            &e,
        )
        .await;
        return Err(e);
    }

    Ok(())
}

async fn report_create_failure(
    ctx: &Context,
    cd: &ClusterDeployment,
    reason: &str,
    artifact: &str,
    name: &str,
    error: &Error,
) {
    warn!(reason, artifact, name, error = %error, "Failed to create artifact");
    ctx.events
        .publish(
            &cluster_ref(cd),
            EventType::Warning,
            reason,
            actions::CREATE,
            Some(format!(
                "Failed to create {artifact} '{name}': {error} ({})",
                generation_note(cd)
            )),
        )
        .await;
}

async fn report_delete_failure(
    ctx: &Context,
    key: &ClusterKey,
    reason: &str,
    artifact: &str,
    name: &str,
    error: &Error,
) {
    warn!(reason, artifact, name, error = %error, "Failed to delete artifact");
    ctx.events
        .publish(
            &cluster_stub_ref(key),
            EventType::Warning,
            reason,
            actions::DELETE,
            Some(format!("Failed to delete {artifact} '{name}': {error}")),
        )
        .await;
}
