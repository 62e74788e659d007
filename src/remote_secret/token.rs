//! Service account token acquisition
//!
//! Clusters older than 1.24 still auto-create token secrets for service
//! accounts, so we read those directly. Newer clusters get a bound token from
//! the TokenRequest API, which we persist in a companion secret together with
//! the cluster CA and namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::kubeconfig::BootstrapKubeconfig;
use super::target::TargetCluster;
use crate::naming::token_secret_name;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Lifetime of requested service account tokens (two hours)
pub const TOKEN_EXPIRATION_SECONDS: i64 = 60 * 120;

/// First minor version without auto-generated service account token secrets
pub const TOKEN_REQUEST_MIN_MINOR: u32 = 24;

/// Secret key holding the cluster root CA
pub const ROOT_CA_KEY: &str = "ca.crt";
/// Secret key holding the service account token
pub const TOKEN_KEY: &str = "token";
/// Secret key holding the service account namespace
pub const NAMESPACE_KEY: &str = "namespace";
/// Annotation binding a token secret to its service account
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// How a token is obtained for the remote service account.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStrategy {
    /// Read the token secret the cluster generated for the service account
    Legacy,
    /// Request a bound token and store it in a companion secret
    TokenRequest,
}

impl TokenStrategy {
    /// Strategy for a server minor version
    pub fn for_minor_version(minor: u32) -> Self {
        if minor >= TOKEN_REQUEST_MIN_MINOR {
            Self::TokenRequest
        } else {
            Self::Legacy
        }
    }

    /// Probe the server once; an unreachable probe assumes a current server.
    pub async fn probe(target: &dyn TargetCluster) -> Self {
        match target.minor_version().await {
            Ok(minor) => Self::for_minor_version(minor),
            Err(e) => {
                warn!(error = %e, "Server version probe failed, assuming TokenRequest support");
                Self::TokenRequest
            }
        }
    }
}

/// CA and token read from a token secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenData {
    /// Root CA bytes
    pub ca: Vec<u8>,
    /// Bearer token
    pub token: String,
}

/// Inputs for locating or creating the token secret
#[derive(Clone, Debug)]
pub struct TokenSecretRequest<'a> {
    /// Namespace of the service account
    pub namespace: &'a str,
    /// Specific secret to use instead of the default
    pub secret_name: Option<&'a str>,
    /// Refresh an existing companion secret in place
    pub allow_overwrite: bool,
}

/// Return the secret holding the service account's token.
pub async fn service_account_secret(
    target: &dyn TargetCluster,
    strategy: TokenStrategy,
    service_account: &ServiceAccount,
    bootstrap: &BootstrapKubeconfig,
    request: &TokenSecretRequest<'_>,
) -> Result<Secret> {
    match strategy {
        TokenStrategy::Legacy => legacy_secret(target, service_account, request).await,
        TokenStrategy::TokenRequest => {
            get_or_create_token_secret(target, service_account, bootstrap, request).await
        }
    }
}

async fn legacy_secret(
    target: &dyn TargetCluster,
    service_account: &ServiceAccount,
    request: &TokenSecretRequest<'_>,
) -> Result<Secret> {
    let sa_name = service_account.metadata.name.as_deref().unwrap_or_default();
    let refs = service_account.secrets.as_deref().unwrap_or_default();
    if refs.is_empty() {
        return Err(Error::missing_data(format!(
            "no secret found in the service account: {}/{sa_name}",
            request.namespace
        )));
    }

    let chosen = match request.secret_name {
        Some(wanted) => refs
            .iter()
            .find(|r| r.name.as_deref() == Some(wanted))
            .ok_or_else(|| {
                Error::precondition(format!("provided secret does not exist: {wanted}"))
            })?,
        None if refs.len() == 1 => &refs[0],
        None => {
            return Err(Error::precondition(format!(
                "wrong number of secrets ({}) in serviceaccount {}/{sa_name}, please specify one",
                refs.len(),
                request.namespace
            )))
        }
    };

    let name = chosen.name.as_deref().unwrap_or_default();
    let namespace = chosen
        .namespace
        .as_deref()
        .filter(|ns| !ns.is_empty())
        .unwrap_or(request.namespace);

    target.get_secret(name, namespace).await?.ok_or_else(|| {
        Error::missing_data(format!(
            "service account token secret {namespace}/{name} not found"
        ))
    })
}

async fn get_or_create_token_secret(
    target: &dyn TargetCluster,
    service_account: &ServiceAccount,
    bootstrap: &BootstrapKubeconfig,
    request: &TokenSecretRequest<'_>,
) -> Result<Secret> {
    let sa_name = service_account.metadata.name.as_deref().unwrap_or_default();
    let secret_name = request
        .secret_name
        .map(str::to_string)
        .unwrap_or_else(|| token_secret_name(sa_name));
    let namespace = request.namespace;

    let existing = target.get_secret(&secret_name, namespace).await?;
    if let Some(existing) = existing.as_ref().filter(|_| !request.allow_overwrite) {
        info!(secret = %secret_name, namespace, "Found existing service account secret");
        return Ok(existing.clone());
    }

    let ca = bootstrap.ca_data()?;
    let token = target
        .request_token(sa_name, namespace, TOKEN_EXPIRATION_SECONDS)
        .await?;
    info!(service_account = %sa_name, namespace, "Service account token generated");

    let data = BTreeMap::from([
        (TOKEN_KEY.to_string(), ByteString(token.into_bytes())),
        (NAMESPACE_KEY.to_string(), ByteString(namespace.as_bytes().to_vec())),
        (ROOT_CA_KEY.to_string(), ByteString(ca)),
    ]);
    let annotations = BTreeMap::from([(
        SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
        sa_name.to_string(),
    )]);

    match existing {
        Some(mut secret) => {
            secret.type_ = Some("Opaque".to_string());
            secret.data = Some(data);
            secret.string_data = None;
            secret.metadata.annotations = Some(annotations);
            info!(secret = %secret_name, namespace, "Updating existing secret with new token");
            target.replace_secret(&secret).await
        }
        None => {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.clone()),
                    namespace: Some(namespace.to_string()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                type_: Some("Opaque".to_string()),
                data: Some(data),
                ..Default::default()
            };
            info!(secret = %secret_name, namespace, "Creating new secret with token");
            target.create_secret(&secret).await
        }
    }
}

/// Read the cluster root CA from a token secret.
pub fn root_ca(secret: &Secret) -> Result<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(ROOT_CA_KEY))
        .map(|ca| ca.0.clone())
        .ok_or_else(|| Error::missing_data(format!("no {ROOT_CA_KEY:?} data found")))
}

/// Read CA and token from a token secret.
pub fn token_data(secret: &Secret) -> Result<TokenData> {
    let ca = root_ca(secret)?;
    let token = secret
        .data
        .as_ref()
        .and_then(|d| d.get(TOKEN_KEY))
        .ok_or_else(|| Error::missing_data(format!("no {TOKEN_KEY:?} data found")))?;
    let token = String::from_utf8(token.0.clone())
        .map_err(|e| Error::missing_data(format!("token is not valid UTF-8: {e}")))?;
    Ok(TokenData { ca, token })
}

/// Read CA and token, re-reading the secret until the control plane fills it in.
///
/// The wait is abandoned with [`Error::Cancelled`] once `cancel` fires.
pub async fn wait_for_token_data(
    target: &dyn TargetCluster,
    secret: &Secret,
    cancel: &CancellationToken,
) -> Result<TokenData> {
    if let Ok(data) = token_data(secret) {
        return Ok(data);
    }

    let name = secret.metadata.name.as_deref().unwrap_or_default();
    let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
    info!(secret = %name, namespace, "Waiting for token data to be populated");

    // The first attempt inside the retry loop is itself a re-read
    let config = RetryConfig {
        max_attempts: RetryConfig::token_wait().max_attempts - 1,
        ..RetryConfig::token_wait()
    };
    let poll = async {
        tokio::time::sleep(config.initial_delay).await;
        retry_with_backoff(&config, "wait_for_token_data", move || async move {
            let current = target.get_secret(name, namespace).await?.ok_or_else(|| {
                Error::missing_data(format!("token secret {namespace}/{name} not found"))
            })?;
            token_data(&current)
        })
        .await
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            info!(secret = %name, namespace, "Token wait interrupted by shutdown");
            Err(Error::cancelled(format!(
                "waiting for token secret {namespace}/{name}"
            )))
        }
        result = poll => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_secret::kubeconfig::fixtures::{bootstrap_yaml, CA_PEM};
    use crate::remote_secret::target::MockTargetCluster;
    use k8s_openapi::api::core::v1::ObjectReference;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const NS: &str = "istio-system";
    const SA: &str = "istio-reader-service-account";

    fn bootstrap() -> BootstrapKubeconfig {
        BootstrapKubeconfig::parse(bootstrap_yaml("https://10.0.0.1:6443").as_bytes())
            .expect("valid kubeconfig")
    }

    fn service_account(secrets: &[&str]) -> ServiceAccount {
        ServiceAccount {
            metadata: ObjectMeta {
                name: Some(SA.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            secrets: Some(
                secrets
                    .iter()
                    .map(|s| ObjectReference {
                        name: Some(s.to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn token_secret(name: &str, data: &[(&str, &[u8])]) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn request(allow_overwrite: bool) -> TokenSecretRequest<'static> {
        TokenSecretRequest {
            namespace: NS,
            secret_name: None,
            allow_overwrite,
        }
    }

    mod strategy {
        use super::*;
        use crate::error::test_support::unavailable;
        use rstest::rstest;

        #[rstest]
        #[case::old(23, TokenStrategy::Legacy)]
        #[case::boundary(24, TokenStrategy::TokenRequest)]
        #[case::new(31, TokenStrategy::TokenRequest)]
        fn chosen_from_minor_version(#[case] minor: u32, #[case] expected: TokenStrategy) {
            assert_eq!(TokenStrategy::for_minor_version(minor), expected);
        }

        #[tokio::test]
        async fn story_failed_probe_assumes_current_server() {
            let mut target = MockTargetCluster::new();
            target
                .expect_minor_version()
                .returning(|| Err(unavailable().into()));
            assert_eq!(TokenStrategy::probe(&target).await, TokenStrategy::TokenRequest);
        }

        #[tokio::test]
        async fn probe_uses_reported_version() {
            let mut target = MockTargetCluster::new();
            target.expect_minor_version().returning(|| Ok(22));
            assert_eq!(TokenStrategy::probe(&target).await, TokenStrategy::Legacy);
        }
    }

    mod legacy {
        use super::*;

        #[tokio::test]
        async fn story_single_secret_is_used() {
            let mut target = MockTargetCluster::new();
            target
                .expect_get_secret()
                .withf(|name, ns| name == "sa-token-abc" && ns == NS)
                .returning(|name, _| Ok(Some(token_secret(name, &[]))));

            let secret = service_account_secret(
                &target,
                TokenStrategy::Legacy,
                &service_account(&["sa-token-abc"]),
                &bootstrap(),
                &request(false),
            )
            .await
            .expect("secret found");
            assert_eq!(secret.metadata.name.as_deref(), Some("sa-token-abc"));
        }

        #[tokio::test]
        async fn story_ambiguous_secrets_require_a_name() {
            let target = MockTargetCluster::new();
            let err = service_account_secret(
                &target,
                TokenStrategy::Legacy,
                &service_account(&["a", "b"]),
                &bootstrap(),
                &request(false),
            )
            .await
            .unwrap_err();
            assert!(err.to_string().contains("wrong number of secrets (2)"));
        }

        #[tokio::test]
        async fn named_secret_is_selected_among_many() {
            let mut target = MockTargetCluster::new();
            target
                .expect_get_secret()
                .withf(|name, _| name == "b")
                .returning(|name, _| Ok(Some(token_secret(name, &[]))));

            let req = TokenSecretRequest {
                secret_name: Some("b"),
                ..request(false)
            };
            let secret = service_account_secret(
                &target,
                TokenStrategy::Legacy,
                &service_account(&["a", "b"]),
                &bootstrap(),
                &req,
            )
            .await
            .expect("secret found");
            assert_eq!(secret.metadata.name.as_deref(), Some("b"));
        }

        #[tokio::test]
        async fn unknown_named_secret_fails() {
            let target = MockTargetCluster::new();
            let req = TokenSecretRequest {
                secret_name: Some("zzz"),
                ..request(false)
            };
            let err = service_account_secret(
                &target,
                TokenStrategy::Legacy,
                &service_account(&["a"]),
                &bootstrap(),
                &req,
            )
            .await
            .unwrap_err();
            assert!(err.to_string().contains("provided secret does not exist: zzz"));
        }

        #[tokio::test]
        async fn no_secrets_fails() {
            let target = MockTargetCluster::new();
            let err = service_account_secret(
                &target,
                TokenStrategy::Legacy,
                &service_account(&[]),
                &bootstrap(),
                &request(false),
            )
            .await
            .unwrap_err();
            assert!(err.to_string().contains("no secret found"));
        }
    }

    mod token_request {
        use super::*;

        #[tokio::test]
        async fn story_companion_secret_is_created_with_token_and_ca() {
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(|_, _| Ok(None));
            target
                .expect_request_token()
                .withf(|sa, ns, exp| sa == SA && ns == NS && *exp == 7200)
                .returning(|_, _, _| Ok("fresh-token".to_string()));
            target.expect_replace_secret().never();
            target.expect_create_secret().returning(|s| Ok(s.clone()));

            let secret = service_account_secret(
                &target,
                TokenStrategy::TokenRequest,
                &service_account(&[]),
                &bootstrap(),
                &request(false),
            )
            .await
            .expect("secret created");

            assert_eq!(
                secret.metadata.name.as_deref(),
                Some("istio-reader-service-account-istio-remote-secret-token")
            );
            assert_eq!(secret.type_.as_deref(), Some("Opaque"));
            assert_eq!(
                secret
                    .metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(SERVICE_ACCOUNT_NAME_ANNOTATION))
                    .map(String::as_str),
                Some(SA)
            );
            let data = token_data(&secret).expect("complete");
            assert_eq!(data.token, "fresh-token");
            assert_eq!(data.ca, CA_PEM);
            assert_eq!(
                secret.data.as_ref().and_then(|d| d.get(NAMESPACE_KEY)),
                Some(&ByteString(NS.as_bytes().to_vec()))
            );
        }

        #[tokio::test]
        async fn story_existing_secret_is_reused_without_overwrite() {
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(|name, _| {
                Ok(Some(token_secret(
                    name,
                    &[(TOKEN_KEY, b"old"), (ROOT_CA_KEY, CA_PEM)],
                )))
            });
            target.expect_request_token().never();
            target.expect_create_secret().never();
            target.expect_replace_secret().never();

            let secret = service_account_secret(
                &target,
                TokenStrategy::TokenRequest,
                &service_account(&[]),
                &bootstrap(),
                &request(false),
            )
            .await
            .expect("reused");
            assert_eq!(token_data(&secret).expect("complete").token, "old");
        }

        #[tokio::test]
        async fn story_overwrite_refreshes_existing_secret_in_place() {
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(|name, _| {
                Ok(Some(token_secret(name, &[(TOKEN_KEY, b"old"), ("stale", b"x")])))
            });
            target
                .expect_request_token()
                .returning(|_, _, _| Ok("rotated".to_string()));
            target.expect_create_secret().never();
            target.expect_replace_secret().times(1).returning(|s| Ok(s.clone()));

            let secret = service_account_secret(
                &target,
                TokenStrategy::TokenRequest,
                &service_account(&[]),
                &bootstrap(),
                &request(true),
            )
            .await
            .expect("replaced");

            let data = secret.data.as_ref().expect("data");
            assert!(!data.contains_key("stale"));
            assert_eq!(token_data(&secret).expect("complete").token, "rotated");
        }
    }

    mod waiting {
        use super::*;

        #[test]
        fn missing_keys_are_named() {
            let err = token_data(&token_secret("s", &[(TOKEN_KEY, b"t")])).unwrap_err();
            assert!(err.to_string().contains(r#"no "ca.crt" data found"#));

            let err = token_data(&token_secret("s", &[(ROOT_CA_KEY, CA_PEM)])).unwrap_err();
            assert!(err.to_string().contains(r#"no "token" data found"#));
        }

        #[tokio::test]
        async fn complete_secret_needs_no_reads() {
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().never();
            let secret = token_secret("s", &[(TOKEN_KEY, b"t"), (ROOT_CA_KEY, CA_PEM)]);
            let data = wait_for_token_data(&target, &secret, &CancellationToken::new())
                .await
                .expect("ready");
            assert_eq!(data.token, "t");
        }

        #[tokio::test(start_paused = true)]
        async fn story_token_appears_after_a_few_polls() {
            let reads = Arc::new(AtomicU32::new(0));
            let counter = reads.clone();
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(move |name, _| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Some(token_secret(name, &[])))
                } else {
                    Ok(Some(token_secret(
                        name,
                        &[(TOKEN_KEY, b"late"), (ROOT_CA_KEY, CA_PEM)],
                    )))
                }
            });

            let data = wait_for_token_data(&target, &token_secret("s", &[]), &CancellationToken::new())
                .await
                .expect("eventually ready");
            assert_eq!(data.token, "late");
            assert_eq!(reads.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn story_token_never_appears_gives_up_after_five_retries() {
            let reads = Arc::new(AtomicU32::new(0));
            let counter = reads.clone();
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(move |name, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(token_secret(name, &[(ROOT_CA_KEY, CA_PEM)])))
            });

            let started = tokio::time::Instant::now();
            let err = wait_for_token_data(&target, &token_secret("s", &[]), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(err.to_string().contains(r#"no "token" data found"#));
            assert_eq!(reads.load(Ordering::SeqCst), 5);
            assert_eq!(started.elapsed(), std::time::Duration::from_secs(5));
        }

        #[tokio::test(start_paused = true)]
        async fn story_shutdown_stops_the_wait_between_reads() {
            let reads = Arc::new(AtomicU32::new(0));
            let counter = reads.clone();
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().returning(move |name, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(token_secret(name, &[(ROOT_CA_KEY, CA_PEM)])))
            });
            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
                    cancel.cancel();
                });
            }

            let started = tokio::time::Instant::now();
            let err = wait_for_token_data(&target, &token_secret("s", &[]), &cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Cancelled(_)));
            assert_eq!(reads.load(Ordering::SeqCst), 1);
            assert!(started.elapsed() < std::time::Duration::from_secs(2));
        }

        #[tokio::test]
        async fn cancelled_token_still_returns_complete_data() {
            let cancel = CancellationToken::new();
            cancel.cancel();
            let mut target = MockTargetCluster::new();
            target.expect_get_secret().never();
            let secret = token_secret("s", &[(TOKEN_KEY, b"t"), (ROOT_CA_KEY, CA_PEM)]);
            let data = wait_for_token_data(&target, &secret, &cancel)
                .await
                .expect("already populated");
            assert_eq!(data.token, "t");
        }
    }
}
