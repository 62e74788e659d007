//! Kubeconfig documents
//!
//! Two directions: [`BootstrapKubeconfig`] reads the delegated kubeconfig we
//! are handed for a cluster (server, CA, client construction), and
//! [`RemoteKubeconfig`] is the minimal single-context document istiod uses to
//! reach that cluster with a service account identity.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::Kubeconfig;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A kubeconfig handed to us for reaching a cluster.
#[derive(Clone, Debug)]
pub struct BootstrapKubeconfig {
    raw: Kubeconfig,
}

impl BootstrapKubeconfig {
    /// Parse a kubeconfig from YAML (or JSON) bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| Error::kubeconfig(format!("kubeconfig is not valid UTF-8: {e}")))?;
        let raw = Kubeconfig::from_yaml(text)
            .map_err(|e| Error::kubeconfig(format!("failed to parse kubeconfig: {e}")))?;
        Ok(Self { raw })
    }

    /// The parsed document, for building a client
    pub fn kubeconfig(&self) -> &Kubeconfig {
        &self.raw
    }

    fn current_cluster(&self) -> Result<(&str, &kube::config::Cluster)> {
        let current = self
            .raw
            .current_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::kubeconfig("no current context found"))?;
        let context = self
            .raw
            .contexts
            .iter()
            .find(|c| c.name == current)
            .and_then(|c| c.context.as_ref())
            .ok_or_else(|| Error::kubeconfig("no current context found"))?;
        let cluster_name = context.cluster.as_str();
        let cluster = self
            .raw
            .clusters
            .iter()
            .find(|c| c.name == cluster_name)
            .and_then(|c| c.cluster.as_ref())
            .ok_or_else(|| Error::kubeconfig(format!("no cluster info for {cluster_name:?}")))?;
        Ok((cluster_name, cluster))
    }

    /// API server address of the current context's cluster
    pub fn server(&self) -> Result<String> {
        let (name, cluster) = self.current_cluster()?;
        cluster
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::kubeconfig(format!("no server found for cluster {name:?}")))
    }

    /// Root CA bytes of the current context's cluster
    ///
    /// Embedded `certificate-authority-data` wins over a `certificate-authority` file.
    pub fn ca_data(&self) -> Result<Vec<u8>> {
        let (name, cluster) = self.current_cluster()?;
        if let Some(data) = cluster.certificate_authority_data.as_deref() {
            if !data.is_empty() {
                return STANDARD.decode(data.trim()).map_err(|e| {
                    Error::kubeconfig(format!("invalid CA data for cluster {name:?}: {e}"))
                });
            }
        }
        if let Some(path) = cluster.certificate_authority.as_deref() {
            if !path.is_empty() {
                return std::fs::read(path).map_err(|e| {
                    Error::kubeconfig(format!("failed to read CA file {path}: {e}"))
                });
            }
        }
        Err(Error::kubeconfig(format!(
            "no CA certificate found for cluster {name:?}"
        )))
    }
}

/// Auth-provider plugin reference placed in a user entry
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProvider {
    /// Plugin name
    pub name: String,
    /// Plugin configuration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

/// Minimal kubeconfig written into remote secrets
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteKubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Current context
    pub current_context: String,
    /// Preferences (always empty)
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

/// Cluster entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterEntry,
}

/// Cluster configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// Context entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextEntry,
}

/// Context configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// User entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserEntry,
}

/// User configuration; exactly one method is set
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Auth-provider plugin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<AuthProvider>,
}

impl RemoteKubeconfig {
    /// Single cluster and context, both named after the cluster, with no users yet.
    fn base(ca_data: &[u8], cluster_name: &str, server: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: cluster_name.to_string(),
                cluster: ClusterEntry {
                    server: server.to_string(),
                    certificate_authority_data: Some(STANDARD.encode(ca_data)),
                },
            }],
            contexts: vec![NamedContext {
                name: cluster_name.to_string(),
                context: ContextEntry {
                    cluster: cluster_name.to_string(),
                    user: cluster_name.to_string(),
                },
            }],
            users: Vec::new(),
            current_context: cluster_name.to_string(),
            preferences: BTreeMap::new(),
        }
    }

    /// Kubeconfig authenticating with a bearer token
    pub fn with_bearer_token(ca_data: &[u8], token: &str, cluster_name: &str, server: &str) -> Self {
        let mut config = Self::base(ca_data, cluster_name, server);
        config.users.push(NamedUser {
            name: cluster_name.to_string(),
            user: UserEntry {
                token: Some(token.to_string()),
                auth_provider: None,
            },
        });
        config
    }

    /// Kubeconfig authenticating through an auth-provider plugin
    pub fn with_auth_provider(
        ca_data: &[u8],
        cluster_name: &str,
        server: &str,
        provider: AuthProvider,
    ) -> Self {
        let mut config = Self::base(ca_data, cluster_name, server);
        config.users.push(NamedUser {
            name: cluster_name.to_string(),
            user: UserEntry {
                token: None,
                auth_provider: Some(provider),
            },
        });
        config
    }

    /// Structural validation before the document is handed to istiod.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::kubeconfig(format!("invalid kubeconfig: {msg}")));

        if self.current_context.is_empty() {
            return invalid("current-context is empty".to_string());
        }
        if !self.contexts.iter().any(|c| c.name == self.current_context) {
            return invalid(format!(
                "context was not found for specified context: {}",
                self.current_context
            ));
        }
        for cluster in &self.clusters {
            if cluster.cluster.server.is_empty() {
                return invalid(format!("no server found for cluster {:?}", cluster.name));
            }
        }
        for ctx in &self.contexts {
            if !self.clusters.iter().any(|c| c.name == ctx.context.cluster) {
                return invalid(format!(
                    "cluster {:?} referenced by context {:?} is not defined",
                    ctx.context.cluster, ctx.name
                ));
            }
            if !self.users.iter().any(|u| u.name == ctx.context.user) {
                return invalid(format!(
                    "user {:?} referenced by context {:?} is not defined",
                    ctx.context.user, ctx.name
                ));
            }
        }
        for user in &self.users {
            match (&user.user.token, &user.user.auth_provider) {
                (Some(_), Some(_)) => {
                    return invalid(format!(
                        "more than one authentication method found for {:?}",
                        user.name
                    ))
                }
                (None, None) => {
                    return invalid(format!("no authentication method found for {:?}", user.name))
                }
                (Some(token), None) if token.is_empty() => {
                    return invalid(format!("empty token for {:?}", user.name))
                }
                (None, Some(provider)) if provider.name.is_empty() => {
                    return invalid(format!("auth-provider without name for {:?}", user.name))
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
