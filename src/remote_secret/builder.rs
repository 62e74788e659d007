//! Remote secret derivation
//!
//! Turns a bootstrap kubeconfig for a member cluster into the Secret istiod
//! watches for: a minimal kubeconfig authenticated as an in-cluster service
//! account, annotated with the cluster name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::kubeconfig::{AuthProvider, BootstrapKubeconfig, RemoteKubeconfig};
use super::target::TargetCluster;
use super::token::{
    root_ca, service_account_secret, wait_for_token_data, TokenSecretRequest, TokenStrategy,
};
use crate::naming::{remote_secret_name, ClusterKey};
use crate::{Error, Result};

/// Name of the config-type secret
pub const CONFIG_SECRET_NAME: &str = "istio-kubeconfig";
/// Data key of the config-type secret
pub const CONFIG_SECRET_KEY: &str = "config";
/// Annotation carrying the cluster name istiod registers the cluster under
pub const CLUSTER_NAME_ANNOTATION: &str = "networking.istio.io/cluster";
/// Label istiod selects remote secrets by
pub const MULTICLUSTER_SECRET_LABEL: &str = "istio/multiCluster";
/// Service account used for remote-type secrets
pub const DEFAULT_SERVICE_ACCOUNT: &str = "istio-reader-service-account";
/// Service account used for config-type secrets
pub const DEFAULT_CONFIG_SERVICE_ACCOUNT: &str = "istiod";

/// Kind of secret to produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SecretType {
    /// Per-cluster remote secret read by a primary istiod
    #[default]
    Remote,
    /// `istio-kubeconfig` used by an external control plane
    Config,
}

impl SecretType {
    fn default_service_account(self) -> &'static str {
        match self {
            Self::Remote => DEFAULT_SERVICE_ACCOUNT,
            Self::Config => DEFAULT_CONFIG_SERVICE_ACCOUNT,
        }
    }
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Config => write!(f, "config"),
        }
    }
}

impl FromStr for SecretType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "remote" => Ok(Self::Remote),
            "config" => Ok(Self::Config),
            other => Err(Error::unsupported(format!("unsupported type: {other}"))),
        }
    }
}

/// How istiod authenticates to the member cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum AuthMode {
    /// Service account bearer token
    #[default]
    BearerToken,
    /// Auth-provider plugin; only the CA is taken from the token secret
    Plugin(AuthProvider),
}

/// Inputs for building one remote secret.
#[derive(Clone, Debug)]
pub struct RemoteSecretOptions {
    /// Cluster the secret grants access to
    pub cluster: ClusterKey,
    /// Kind of secret
    pub secret_type: SecretType,
    /// Authentication method
    pub auth: AuthMode,
    /// Service account override
    pub service_account: Option<String>,
    /// Namespace of the service account and of the produced secret
    pub namespace: String,
    /// API server address override
    pub server_override: Option<String>,
    /// Specific token secret of the service account
    pub secret_name: Option<String>,
    /// Issue a fresh token even when one is already stored
    pub allow_overwrite: bool,
    /// Abandons the wait for token data on shutdown
    pub cancel: CancellationToken,
}

impl RemoteSecretOptions {
    /// Bearer-token remote secret for `cluster` in `namespace`
    pub fn new(cluster: ClusterKey, namespace: impl Into<String>) -> Self {
        Self {
            cluster,
            secret_type: SecretType::Remote,
            auth: AuthMode::BearerToken,
            service_account: None,
            namespace: namespace.into(),
            server_override: None,
            secret_name: None,
            allow_overwrite: false,
            cancel: CancellationToken::new(),
        }
    }

    fn service_account(&self) -> &str {
        self.service_account
            .as_deref()
            .filter(|sa| !sa.is_empty())
            .unwrap_or(self.secret_type.default_service_account())
    }

    fn output_name(&self) -> String {
        match self.secret_type {
            SecretType::Remote => remote_secret_name(&self.cluster),
            SecretType::Config => CONFIG_SECRET_NAME.to_string(),
        }
    }
}

/// A built secret plus any non-fatal warning about its contents.
#[derive(Clone, Debug)]
pub struct BuiltSecret {
    /// Secret ready to be stored on the management cluster
    pub secret: Secret,
    /// Problem worth surfacing that did not stop the build
    pub warning: Option<String>,
}

/// Server address for the remote kubeconfig, with a warning for loopback addresses.
fn resolve_server(
    bootstrap: &BootstrapKubeconfig,
    server_override: Option<&str>,
) -> Result<(String, Option<String>)> {
    if let Some(server) = server_override.filter(|s| !s.is_empty()) {
        return Ok((server.to_string(), None));
    }
    let server = bootstrap.server()?;
    let warning = (server.contains("127.0.0.1") || server.contains("localhost")).then(|| {
        format!(
            "server in Kubeconfig is {server}. This is likely not reachable from remote clusters"
        )
    });
    Ok((server, warning))
}

/// Build the remote secret for a member cluster.
pub async fn create_remote_secret(
    target: &dyn TargetCluster,
    bootstrap: &BootstrapKubeconfig,
    opts: &RemoteSecretOptions,
) -> Result<BuiltSecret> {
    let sa_name = opts.service_account();
    let service_account = target
        .get_service_account(sa_name, &opts.namespace)
        .await?
        .ok_or_else(|| {
            Error::precondition(format!(
                "service account not found, it should be created by K0rdent Istio helm chart: {}/{sa_name}",
                opts.namespace
            ))
        })?;

    let strategy = TokenStrategy::probe(target).await;
    let token_secret = service_account_secret(
        target,
        strategy,
        &service_account,
        bootstrap,
        &TokenSecretRequest {
            namespace: &opts.namespace,
            secret_name: opts.secret_name.as_deref(),
            allow_overwrite: opts.allow_overwrite,
        },
    )
    .await?;

    let (server, warning) = resolve_server(bootstrap, opts.server_override.as_deref())?;
    if let Some(w) = &warning {
        warn!(cluster = %opts.cluster, "{w}");
    }

    let cluster_name = opts.cluster.name.as_str();
    let kubeconfig = match &opts.auth {
        AuthMode::BearerToken => {
            let data = wait_for_token_data(target, &token_secret, &opts.cancel).await?;
            RemoteKubeconfig::with_bearer_token(&data.ca, &data.token, cluster_name, &server)
        }
        AuthMode::Plugin(provider) => {
            let ca = root_ca(&token_secret)?;
            RemoteKubeconfig::with_auth_provider(&ca, cluster_name, &server, provider.clone())
        }
    };
    kubeconfig.validate()?;

    let name = opts.output_name();
    let key = if name == CONFIG_SECRET_NAME {
        CONFIG_SECRET_KEY
    } else {
        cluster_name
    };
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(opts.namespace.clone()),
            annotations: Some(BTreeMap::from([(
                CLUSTER_NAME_ANNOTATION.to_string(),
                cluster_name.to_string(),
            )])),
            labels: Some(BTreeMap::from([(
                MULTICLUSTER_SECRET_LABEL.to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(kubeconfig.to_yaml()?.into_bytes()),
        )])),
        ..Default::default()
    };

    info!(cluster = %opts.cluster, secret = %name, ?strategy, "Remote secret built");
    Ok(BuiltSecret { secret, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_secret::kubeconfig::fixtures::{bootstrap_yaml, CA_PEM};
    use crate::remote_secret::target::MockTargetCluster;
    use crate::remote_secret::token::{ROOT_CA_KEY, TOKEN_KEY};
    use k8s_openapi::api::core::v1::ServiceAccount;
    use rstest::rstest;

    const NS: &str = "istio-system";

    fn bootstrap(server: &str) -> BootstrapKubeconfig {
        BootstrapKubeconfig::parse(bootstrap_yaml(server).as_bytes()).expect("valid kubeconfig")
    }

    fn sa(name: &str) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn populated(name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (TOKEN_KEY.to_string(), ByteString(b"sa-token".to_vec())),
                (ROOT_CA_KEY.to_string(), ByteString(CA_PEM.to_vec())),
            ])),
            ..Default::default()
        }
    }

    /// Target on a current server where the companion token secret exists.
    fn target_with_token(expected_sa: &'static str) -> MockTargetCluster {
        let mut target = MockTargetCluster::new();
        target
            .expect_get_service_account()
            .withf(move |name, ns| name == expected_sa && ns == NS)
            .returning(|name, _| Ok(Some(sa(name))));
        target.expect_minor_version().returning(|| Ok(30));
        target
            .expect_get_secret()
            .returning(|name, _| Ok(Some(populated(name))));
        target
    }

    fn decoded(secret: &Secret, key: &str) -> String {
        let bytes = &secret.data.as_ref().expect("data")[key].0;
        String::from_utf8(bytes.clone()).expect("utf-8")
    }

    #[rstest]
    #[case::remote("remote", SecretType::Remote)]
    #[case::config("config", SecretType::Config)]
    fn secret_type_parses_and_displays(#[case] text: &str, #[case] ty: SecretType) {
        assert_eq!(text.parse::<SecretType>().expect("known type"), ty);
        assert_eq!(ty.to_string(), text);
    }

    #[test]
    fn unknown_secret_type_is_unsupported() {
        let err = "primary".parse::<SecretType>().unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
    }

    #[tokio::test]
    async fn story_bearer_token_secret_for_member_cluster() {
        let target = target_with_token(DEFAULT_SERVICE_ACCOUNT);
        let opts = RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS);

        let built = create_remote_secret(&target, &bootstrap("https://10.0.0.1:6443"), &opts)
            .await
            .expect("secret built");
        assert!(built.warning.is_none());

        let secret = built.secret;
        assert_eq!(
            secret.metadata.name.as_deref(),
            Some("istio-remote-secret-3f132440")
        );
        assert_eq!(secret.metadata.namespace.as_deref(), Some(NS));
        assert_eq!(
            secret.metadata.annotations.as_ref().expect("annotations")[CLUSTER_NAME_ANNOTATION],
            "c1"
        );
        assert_eq!(
            secret.metadata.labels.as_ref().expect("labels")[MULTICLUSTER_SECRET_LABEL],
            "true"
        );

        let yaml = decoded(&secret, "c1");
        assert!(yaml.contains("server: https://10.0.0.1:6443"));
        assert!(yaml.contains("token: sa-token"));
        assert!(yaml.contains("current-context: c1"));
    }

    #[tokio::test]
    async fn story_config_secret_uses_istiod_account_and_config_key() {
        let target = target_with_token(DEFAULT_CONFIG_SERVICE_ACCOUNT);
        let opts = RemoteSecretOptions {
            secret_type: SecretType::Config,
            ..RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS)
        };

        let built = create_remote_secret(&target, &bootstrap("https://10.0.0.1:6443"), &opts)
            .await
            .expect("secret built");
        assert_eq!(built.secret.metadata.name.as_deref(), Some(CONFIG_SECRET_NAME));
        assert!(decoded(&built.secret, CONFIG_SECRET_KEY).contains("token: sa-token"));
    }

    #[tokio::test]
    async fn story_missing_service_account_points_at_helm_chart() {
        let mut target = MockTargetCluster::new();
        target.expect_get_service_account().returning(|_, _| Ok(None));
        target.expect_minor_version().never();

        let opts = RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS);
        let err = create_remote_secret(&target, &bootstrap("https://10.0.0.1"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err
            .to_string()
            .contains("service account not found, it should be created by K0rdent Istio helm chart"));
    }

    #[tokio::test]
    async fn story_loopback_server_builds_with_warning() {
        let target = target_with_token(DEFAULT_SERVICE_ACCOUNT);
        let opts = RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS);

        let built = create_remote_secret(&target, &bootstrap("https://127.0.0.1:6443"), &opts)
            .await
            .expect("warning is not fatal");
        assert!(built
            .warning
            .as_deref()
            .is_some_and(|w| w.contains("127.0.0.1")));
    }

    #[tokio::test]
    async fn server_override_wins_over_kubeconfig() {
        let target = target_with_token(DEFAULT_SERVICE_ACCOUNT);
        let opts = RemoteSecretOptions {
            server_override: Some("https://c1.example.com".to_string()),
            ..RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS)
        };

        let built = create_remote_secret(&target, &bootstrap("https://localhost"), &opts)
            .await
            .expect("secret built");
        assert!(built.warning.is_none());
        assert!(decoded(&built.secret, "c1").contains("server: https://c1.example.com"));
    }

    #[tokio::test]
    async fn story_plugin_auth_needs_only_the_ca() {
        let mut target = MockTargetCluster::new();
        target
            .expect_get_service_account()
            .returning(|name, _| Ok(Some(sa(name))));
        target.expect_minor_version().returning(|| Ok(30));
        target.expect_get_secret().returning(|name, _| {
            let mut secret = populated(name);
            if let Some(data) = secret.data.as_mut() {
                data.remove(TOKEN_KEY);
            }
            Ok(Some(secret))
        });

        let opts = RemoteSecretOptions {
            auth: AuthMode::Plugin(AuthProvider {
                name: "gcp".to_string(),
                config: BTreeMap::new(),
            }),
            ..RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS)
        };
        let built = create_remote_secret(&target, &bootstrap("https://10.0.0.1"), &opts)
            .await
            .expect("secret built");
        let yaml = decoded(&built.secret, "c1");
        assert!(yaml.contains("auth-provider:"));
        assert!(!yaml.contains("token:"));
    }

    #[tokio::test(start_paused = true)]
    async fn story_shutdown_abandons_build_waiting_for_token() {
        let mut target = MockTargetCluster::new();
        target
            .expect_get_service_account()
            .returning(|name, _| Ok(Some(sa(name))));
        target.expect_minor_version().returning(|| Ok(30));
        // the companion secret exists but the token was never filled in
        target.expect_get_secret().returning(|name, _| {
            let mut secret = populated(name);
            secret.data = None;
            Ok(Some(secret))
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let opts = RemoteSecretOptions {
            cancel,
            ..RemoteSecretOptions::new(ClusterKey::new("c1", "ns1"), NS)
        };
        let err = create_remote_secret(&target, &bootstrap("https://10.0.0.1"), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
