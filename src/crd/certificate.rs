//! cert-manager Certificate, restricted to the fields the operator sets

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ECDSA key algorithm name as understood by cert-manager
pub const ECDSA_KEY_ALGORITHM: &str = "ECDSA";

/// Specification for a cert-manager Certificate
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "Certificate",
    plural = "certificates",
    shortname = "cert",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Issue a CA certificate
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,

    /// Subject common name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    /// Additional subject fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<X509Subject>,

    /// Private key parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<CertificatePrivateKey>,

    /// Secret the signed certificate and key are written to
    pub secret_name: String,

    /// Issuer that signs the certificate
    pub issuer_ref: IssuerRef,
}

/// X.509 subject fields
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct X509Subject {
    /// Organizations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<String>,
}

/// Private key parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificatePrivateKey {
    /// Key algorithm (RSA, ECDSA, Ed25519)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,

    /// Key size in bits (curve size for ECDSA)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// Reference to an Issuer or ClusterIssuer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Issuer API group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_ca_keeps_cert_manager_casing() {
        let spec = CertificateSpec {
            is_ca: true,
            secret_name: "s".to_string(),
            issuer_ref: IssuerRef {
                name: "root".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).expect("serializes");
        assert_eq!(json["isCA"], true);
        assert_eq!(json["secretName"], "s");
        assert_eq!(json["issuerRef"]["name"], "root");
        assert!(json.get("privateKey").is_none());
    }
}
