//! # Custom Resource Definitions
//!
//! The three CRDs driving the operator:
//!
//! - [`InfisicalSecret`] pulls Infisical secrets into managed cluster
//!   Secrets/ConfigMaps.
//! - [`InfisicalPushSecret`] pushes an existing cluster Secret up to
//!   Infisical.
//! - [`InfisicalDynamicSecret`] materializes short-lived credentials from
//!   Infisical dynamic-secret leases.
//!
//! All three share the core shape: host override, TLS CA reference,
//! exactly one authentication strategy, and an optional resync interval.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

mod auth;
mod status;

pub use auth::{
    Authentication, AuthenticationDetails, AuthStrategy, KubeSecretReference,
    MachineIdentityScope, ServiceAccountAuth, ServiceTokenAuth, ServiceTokenScope, UniversalAuth,
};
pub use status::{set_condition, Condition, ConditionStatus};

/// Reference to a Kubernetes secret holding a custom CA certificate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CaReference {
    pub secret_name: String,
    pub secret_namespace: String,
    pub secret_key: String,
}

/// Transport TLS configuration. The `caRef` fields are all-or-nothing; a
/// partially populated reference is a configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub ca_ref: CaReference,
}

/// What happens to a managed object when the CR stops referencing it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum CreationPolicy {
    /// The CR owns the object: an owner reference is installed and the
    /// orphan collector deletes it once it is no longer referenced.
    Owner,
    /// The object is written but never deleted by the operator.
    #[default]
    Orphan,
}

/// User template applied to fetched secrets before they are written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    /// Union the raw fetched key/value map underneath the templated entries.
    #[serde(default)]
    pub include_all_secrets: bool,
    /// Output key to template expression. Each expression sees every fetched
    /// secret as `{{ KEY.value }}` / `{{ KEY.secret_path }}`.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A managed Kubernetes Secret the operator writes fetched secrets into.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKubeSecretConfig {
    pub secret_name: String,
    pub secret_namespace: String,
    #[serde(default)]
    pub creation_policy: CreationPolicy,
    /// Kubernetes secret type, defaults to Opaque.
    #[serde(default)]
    pub secret_type: Option<String>,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// A managed ConfigMap the operator writes fetched secrets into.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKubeConfigMapConfig {
    pub config_map_name: String,
    pub config_map_namespace: String,
    #[serde(default)]
    pub creation_policy: CreationPolicy,
    #[serde(default)]
    pub template: Option<SecretTemplate>,
}

/// InfisicalSecret pulls secrets from Infisical into managed cluster objects.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.infisical.com",
    version = "v1alpha1",
    kind = "InfisicalSecret",
    namespaced,
    status = "InfisicalSecretStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Secrets", "type":"integer", "jsonPath":".status.secretsSynced"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalSecretSpec {
    /// Infisical API host override. When empty, the global operator config
    /// or the default cloud host is used. Serialized as `hostAPI` for parity
    /// with the CLI and config map keys.
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Exactly one strategy must be populated.
    pub authentication: Authentication,
    /// Periodic resync interval, e.g. "30s", "5m", "1h", "1d", "1w".
    /// Seconds require at least 5. Empty disables periodic resync.
    #[serde(default)]
    pub resync_interval: Option<String>,
    #[serde(default)]
    pub managed_kube_secret_references: Vec<ManagedKubeSecretConfig>,
    #[serde(default)]
    pub managed_kube_config_map_references: Vec<ManagedKubeConfigMapConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub last_reconcile_time: Option<String>,
    #[serde(default)]
    pub secrets_synced: Option<i32>,
}

/// Source of the data an InfisicalPushSecret sends upstream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PushSecretSource {
    pub secret_name: String,
    pub secret_namespace: String,
}

/// What happens to pushed upstream secrets when the CR is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PushDeletionPolicy {
    /// Leave pushed secrets in place.
    #[default]
    None,
    /// Delete every key this CR pushed.
    Delete,
}

/// InfisicalPushSecret pushes a cluster Secret's entries up to Infisical.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.infisical.com",
    version = "v1alpha1",
    kind = "InfisicalPushSecret",
    namespaced,
    status = "InfisicalPushSecretStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalPushSecretSpec {
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    pub authentication: Authentication,
    #[serde(default)]
    pub resync_interval: Option<String>,
    /// The cluster Secret whose entries are pushed.
    pub push: PushSecretSource,
    #[serde(default)]
    pub deletion_policy: PushDeletionPolicy,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalPushSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub last_push_time: Option<String>,
    #[serde(default)]
    pub pushed_keys: Vec<String>,
}

/// InfisicalDynamicSecret materializes short-lived credentials from a
/// dynamic-secret lease, renewing via requeue before expiry.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "secrets.infisical.com",
    version = "v1alpha1",
    kind = "InfisicalDynamicSecret",
    namespaced,
    status = "InfisicalDynamicSecretStatus",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalDynamicSecretSpec {
    #[serde(default, rename = "hostAPI")]
    pub host_api: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    pub authentication: Authentication,
    /// Name of the dynamic secret definition in Infisical.
    pub dynamic_secret_name: String,
    /// Requested lease TTL, e.g. "1m", "1h". Defaults to the definition's TTL.
    #[serde(default, rename = "leaseTTL")]
    pub lease_ttl: Option<String>,
    /// Where the leased credentials land in the cluster.
    pub managed_secret_reference: ManagedKubeSecretConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfisicalDynamicSecretStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub lease_id: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infisical_secret_spec_deserializes_camel_case() {
        let spec: InfisicalSecretSpec = serde_json::from_value(serde_json::json!({
            "hostAPI": "https://infisical.corp",
            "authentication": {
                "universalAuth": {
                    "credentialsRef": {
                        "secretName": "ua-creds",
                        "secretNamespace": "default"
                    },
                    "secretsScope": {
                        "projectSlug": "backend",
                        "envSlug": "prod",
                        "secretsPath": "/app"
                    }
                }
            },
            "managedKubeSecretReferences": [{
                "secretName": "managed",
                "secretNamespace": "default",
                "creationPolicy": "Owner"
            }]
        }))
        .unwrap();

        assert_eq!(spec.host_api.as_deref(), Some("https://infisical.corp"));
        let managed = &spec.managed_kube_secret_references[0];
        assert_eq!(managed.creation_policy, CreationPolicy::Owner);
        assert!(managed.template.is_none());
        let ua = spec.authentication.universal_auth.unwrap();
        assert_eq!(ua.secrets_scope.env_slug, "prod");
        assert_eq!(ua.secrets_scope.secrets_path, "/app");
        assert!(!ua.secrets_scope.recursive);
    }

    #[test]
    fn test_creation_policy_defaults_to_orphan() {
        let managed: ManagedKubeSecretConfig = serde_json::from_value(serde_json::json!({
            "secretName": "managed",
            "secretNamespace": "default"
        }))
        .unwrap();
        assert_eq!(managed.creation_policy, CreationPolicy::Orphan);
    }

    #[test]
    fn test_secret_template_defaults() {
        let template: SecretTemplate = serde_json::from_value(serde_json::json!({
            "data": {"combined": "{{ FOO.value }}"}
        }))
        .unwrap();
        assert!(!template.include_all_secrets);
        assert_eq!(template.data.len(), 1);
    }
}
