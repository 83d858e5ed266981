//! Authentication configuration shared by all three CR kinds, plus the
//! in-process representation of a resolved authentication.

use crate::error::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to a Kubernetes secret holding credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubeSecretReference {
    pub secret_name: String,
    pub secret_namespace: String,
}

/// Upstream scope selected by the legacy service-token strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenScope {
    pub env_slug: String,
    #[serde(default = "default_secrets_path")]
    pub secrets_path: String,
    #[serde(default)]
    pub recursive: bool,
}

/// Legacy service-token authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenAuth {
    pub service_token_secret_reference: KubeSecretReference,
    pub secrets_scope: ServiceTokenScope,
}

/// Legacy service-account authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountAuth {
    pub service_account_secret_reference: KubeSecretReference,
    pub project_id: String,
    pub environment_name: String,
}

/// The scope a machine identity reads from: project (by id or slug),
/// environment, secrets path, recursion, and an optional single secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineIdentityScope {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project_slug: String,
    pub env_slug: String,
    #[serde(default = "default_secrets_path")]
    pub secrets_path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub secret_name: Option<String>,
}

impl MachineIdentityScope {
    /// Validate before any upstream request. Project id and slug are
    /// mutually exclusive selectors and one of them is required.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.is_empty() && self.project_slug.is_empty() {
            return Err(Error::InvalidScope(
                "one of projectId or projectSlug is required".to_string(),
            ));
        }
        if !self.project_id.is_empty() && !self.project_slug.is_empty() {
            return Err(Error::InvalidScope(
                "projectId and projectSlug are mutually exclusive".to_string(),
            ));
        }
        if self.env_slug.is_empty() {
            return Err(Error::InvalidScope("envSlug is required".to_string()));
        }
        if !self.secrets_path.starts_with('/') {
            return Err(Error::InvalidScope(format!(
                "secretsPath '{}' must start with '/'",
                self.secrets_path
            )));
        }
        Ok(())
    }
}

/// Machine-identity authentication via universal auth (client id + secret).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UniversalAuth {
    pub credentials_ref: KubeSecretReference,
    pub secrets_scope: MachineIdentityScope,
}

/// Authentication block. Exactly one strategy must be populated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(default)]
    pub service_token: Option<ServiceTokenAuth>,
    #[serde(default)]
    pub service_account: Option<ServiceAccountAuth>,
    #[serde(default)]
    pub universal_auth: Option<UniversalAuth>,
}

impl Authentication {
    /// The strategy this block selects, or an error when zero or more than
    /// one strategy is populated.
    pub fn strategy(&self) -> Result<AuthStrategy> {
        let mut selected = Vec::new();
        if self.service_token.is_some() {
            selected.push(AuthStrategy::ServiceToken);
        }
        if self.service_account.is_some() {
            selected.push(AuthStrategy::ServiceAccount);
        }
        if self.universal_auth.is_some() {
            selected.push(AuthStrategy::UniversalAuth);
        }
        match selected.as_slice() {
            [one] => Ok(*one),
            [] => Err(Error::Auth(
                "no authentication method provided. Please configure an authentication method then try again"
                    .to_string(),
            )),
            _ => Err(Error::Auth(
                "multiple authentication methods provided; exactly one must be set".to_string(),
            )),
        }
    }
}

/// Which authentication strategy a CR selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStrategy {
    ServiceToken,
    ServiceAccount,
    UniversalAuth,
}

impl AuthStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStrategy::ServiceToken => "ServiceToken",
            AuthStrategy::ServiceAccount => "ServiceAccount",
            AuthStrategy::UniversalAuth => "UniversalAuth",
        }
    }

    /// Machine-identity strategies carry a pre-authenticated client and are
    /// eligible for instant-update subscriptions.
    pub fn is_machine_identity(&self) -> bool {
        matches!(self, AuthStrategy::UniversalAuth)
    }
}

/// Outcome of a successful authentication, cached per CR.
#[derive(Debug, Clone)]
pub struct AuthenticationDetails {
    pub strategy: AuthStrategy,
    pub machine_identity_scope: MachineIdentityScope,
}

impl AuthenticationDetails {
    pub fn is_machine_identity(&self) -> bool {
        self.strategy.is_machine_identity()
    }
}

fn default_secrets_path() -> String {
    "/".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(project_id: &str, project_slug: &str, env: &str, path: &str) -> MachineIdentityScope {
        MachineIdentityScope {
            project_id: project_id.to_string(),
            project_slug: project_slug.to_string(),
            env_slug: env.to_string(),
            secrets_path: path.to_string(),
            recursive: false,
            secret_name: None,
        }
    }

    #[test]
    fn test_scope_requires_project_selector() {
        assert!(scope("", "", "prod", "/").validate().is_err());
        assert!(scope("p1", "", "prod", "/").validate().is_ok());
        assert!(scope("", "backend", "prod", "/").validate().is_ok());
    }

    #[test]
    fn test_scope_rejects_both_project_selectors() {
        assert!(scope("p1", "backend", "prod", "/").validate().is_err());
    }

    #[test]
    fn test_scope_requires_env_and_absolute_path() {
        assert!(scope("p1", "", "", "/").validate().is_err());
        assert!(scope("p1", "", "prod", "app").validate().is_err());
    }

    #[test]
    fn test_authentication_exactly_one_strategy() {
        let none = Authentication::default();
        assert!(none.strategy().is_err());

        let one = Authentication {
            universal_auth: Some(UniversalAuth::default()),
            ..Default::default()
        };
        assert_eq!(one.strategy().unwrap(), AuthStrategy::UniversalAuth);

        let two = Authentication {
            universal_auth: Some(UniversalAuth::default()),
            service_token: Some(ServiceTokenAuth::default()),
            ..Default::default()
        };
        assert!(two.strategy().is_err());
    }

    #[test]
    fn test_machine_identity_flag() {
        assert!(AuthStrategy::UniversalAuth.is_machine_identity());
        assert!(!AuthStrategy::ServiceToken.is_machine_identity());
        assert!(!AuthStrategy::ServiceAccount.is_machine_identity());
    }
}
