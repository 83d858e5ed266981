//! # Constants
//!
//! Shared constants used throughout the operator.

/// Default Infisical API host used when neither the CR nor the global
/// operator config override it.
pub const DEFAULT_API_HOST: &str = "https://app.infisical.com/api";

/// User agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("infisical-operator/", env!("CARGO_PKG_VERSION"));

/// Finalizer installed on InfisicalSecret resources so streams and cached
/// auth contexts are torn down before the CR disappears.
pub const SECRETS_FINALIZER: &str = "secrets.finalizers.infisical.com";

/// Finalizer installed on InfisicalPushSecret resources.
pub const PUSH_SECRETS_FINALIZER: &str = "push-secrets.finalizers.infisical.com";

/// Annotation carrying the content etag of the last write.
pub const SECRET_VERSION_ANNOTATION: &str = "secrets.infisical.com/secret-version";

/// Annotation listing the label keys the operator introduced on the last write.
pub const MANAGED_LABELS_ANNOTATION: &str = "secrets.infisical.com/managed-labels";

/// Annotation listing the annotation keys the operator introduced on the last write.
pub const MANAGED_ANNOTATIONS_ANNOTATION: &str = "secrets.infisical.com/managed-annotations";

/// Annotation prefixes that are never treated as CR-managed, whatever their source.
pub const SYSTEM_PREFIXES: [&str; 4] = [
    "kubectl.kubernetes.io/",
    "kubernetes.io/",
    "k8s.io/",
    "helm.sh/",
];

/// Key inside a service-token secret holding the Infisical token.
pub const SERVICE_TOKEN_SECRET_KEY: &str = "infisicalToken";

/// Keys inside a service-account secret.
pub const SERVICE_ACCOUNT_ACCESS_KEY: &str = "serviceAccountAccessKey";
pub const SERVICE_ACCOUNT_PUBLIC_KEY: &str = "serviceAccountPublicKey";
pub const SERVICE_ACCOUNT_PRIVATE_KEY: &str = "serviceAccountPrivateKey";

/// Keys inside a universal-auth credentials secret.
pub const UNIVERSAL_AUTH_CLIENT_ID_KEY: &str = "clientId";
pub const UNIVERSAL_AUTH_CLIENT_SECRET_KEY: &str = "clientSecret";

/// Name of the cluster-wide operator ConfigMap.
pub const GLOBAL_CONFIG_MAP_NAME: &str = "infisical-config";

/// Default HTTP server port for metrics and health probes.
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default requeue interval for reconciliation errors (seconds).
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 60;
