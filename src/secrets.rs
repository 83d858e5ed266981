//! # Secret Fetch Facade
//!
//! Uniform fetch interface over the authentication strategies, plus the
//! authentication dispatch itself. Legacy strategies resolve credentials
//! from cluster secrets on every fetch; machine identity uses the
//! pre-authenticated client cached per CR.

use crate::api::{ApiClient, SecretVariable};
use crate::constants::{
    SERVICE_ACCOUNT_ACCESS_KEY, SERVICE_ACCOUNT_PRIVATE_KEY, SERVICE_ACCOUNT_PUBLIC_KEY,
    SERVICE_TOKEN_SECRET_KEY, UNIVERSAL_AUTH_CLIENT_ID_KEY, UNIVERSAL_AUTH_CLIENT_SECRET_KEY,
};
use crate::config::GlobalConfig;
use crate::crd::{
    Authentication, AuthenticationDetails, AuthStrategy, KubeSecretReference, MachineIdentityScope,
    TlsConfig,
};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::info;

/// Operator-wide cluster scope, decided at startup.
#[derive(Debug, Clone)]
pub struct OperatorScope {
    /// When set, the operator is confined to this namespace and must not
    /// read secrets elsewhere.
    pub namespace: Option<String>,
}

impl OperatorScope {
    pub fn cluster_wide() -> Self {
        Self { namespace: None }
    }

    fn check(&self, requested_namespace: &str) -> Result<()> {
        match &self.namespace {
            Some(own) if own != requested_namespace => Err(Error::NamespaceScoped(format!(
                "cannot read secrets in namespace '{requested_namespace}'. This operator \
                 installation is namespace scoped to '{own}'; place the referenced secret in \
                 the operator's namespace"
            ))),
            _ => Ok(()),
        }
    }
}

/// Read a referenced cluster secret, honouring the operator's namespace scope.
pub async fn get_kube_secret(
    client: &Client,
    reference: &KubeSecretReference,
    scope: &OperatorScope,
) -> Result<Secret> {
    scope.check(&reference.secret_namespace)?;
    let api: Api<Secret> = Api::namespaced(client.clone(), &reference.secret_namespace);
    api.get_opt(&reference.secret_name)
        .await?
        .ok_or_else(|| {
            Error::Auth(format!(
                "credentials secret '{}/{}' not found",
                reference.secret_namespace, reference.secret_name
            ))
        })
}

/// Resolve the custom CA certificate for a CR: its own `tls.caRef` wins,
/// then the global operator config; absent both, the system roots are used.
pub async fn resolve_ca_certificate(
    client: &Client,
    cr_tls: Option<&TlsConfig>,
    global_config: &GlobalConfig,
    scope: &OperatorScope,
) -> Result<Option<String>> {
    let Some(tls) = cr_tls.or(global_config.tls.as_ref()) else {
        return Ok(None);
    };
    let reference = KubeSecretReference {
        secret_name: tls.ca_ref.secret_name.clone(),
        secret_namespace: tls.ca_ref.secret_namespace.clone(),
    };
    let secret = get_kube_secret(client, &reference, scope).await?;
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&tls.ca_ref.secret_key))
        .ok_or_else(|| {
            Error::Config(format!(
                "CA certificate secret '{}/{}' is missing key '{}'",
                tls.ca_ref.secret_namespace, tls.ca_ref.secret_name, tls.ca_ref.secret_key
            ))
        })?;
    let certificate = String::from_utf8(data.0.clone())
        .map_err(|_| Error::Config("CA certificate is not valid UTF-8".to_string()))?;
    Ok(Some(certificate))
}

fn secret_value(secret: &Secret, key: &str) -> Result<String> {
    let data = secret.data.as_ref().and_then(|data| data.get(key));
    match data {
        Some(bytes) => String::from_utf8(bytes.0.clone())
            .map_err(|_| Error::Auth(format!("credentials key '{key}' is not valid UTF-8"))),
        None => Err(Error::Auth(format!("credentials secret is missing key '{key}'"))),
    }
}

/// Authenticate the per-CR client according to the CR's strategy and return
/// the cached authentication outcome.
pub async fn handle_authentication(
    kube: &Client,
    api: &ApiClient,
    authentication: &Authentication,
    scope: &OperatorScope,
) -> Result<AuthenticationDetails> {
    let strategy = authentication.strategy()?;
    match strategy {
        AuthStrategy::ServiceToken => {
            let Some(auth) = &authentication.service_token else {
                return Err(Error::Auth("service token configuration missing".to_string()));
            };
            let secret = get_kube_secret(kube, &auth.service_token_secret_reference, scope).await?;
            let token = secret_value(&secret, SERVICE_TOKEN_SECRET_KEY)?;
            api.login_service_token(&token);
            info!("authenticated via legacy service token");
        }
        AuthStrategy::ServiceAccount => {
            let Some(auth) = &authentication.service_account else {
                return Err(Error::Auth("service account configuration missing".to_string()));
            };
            let secret =
                get_kube_secret(kube, &auth.service_account_secret_reference, scope).await?;
            let access_key = secret_value(&secret, SERVICE_ACCOUNT_ACCESS_KEY)?;
            secret_value(&secret, SERVICE_ACCOUNT_PUBLIC_KEY)?;
            secret_value(&secret, SERVICE_ACCOUNT_PRIVATE_KEY)?;
            api.set_access_token(access_key);
            api.get_service_account_details().await?;
            info!("authenticated via legacy service account");
        }
        AuthStrategy::UniversalAuth => {
            let Some(auth) = &authentication.universal_auth else {
                return Err(Error::Auth("universal auth configuration missing".to_string()));
            };
            auth.secrets_scope.validate()?;
            let secret = get_kube_secret(kube, &auth.credentials_ref, scope).await?;
            let client_id = secret_value(&secret, UNIVERSAL_AUTH_CLIENT_ID_KEY)?;
            let client_secret = secret_value(&secret, UNIVERSAL_AUTH_CLIENT_SECRET_KEY)?;
            api.login_universal_auth(&client_id, &client_secret).await?;
            info!("authenticated via machine identity");
        }
    }

    let machine_identity_scope = authentication
        .universal_auth
        .as_ref()
        .map(|auth| auth.secrets_scope.clone())
        .unwrap_or_default();

    Ok(AuthenticationDetails {
        strategy,
        machine_identity_scope,
    })
}

/// Resolve the project id for a machine-identity scope, looking the slug up
/// on demand.
pub async fn resolve_project_id(api: &ApiClient, scope: &MachineIdentityScope) -> Result<String> {
    if !scope.project_id.is_empty() {
        return Ok(scope.project_id.clone());
    }
    let project_id = api.extract_project_id_from_slug(&scope.project_slug).await?;
    info!(
        project_id = %project_id,
        project_slug = %scope.project_slug,
        "resolved project id from slug"
    );
    Ok(project_id)
}

/// Fetch the secrets a CR's authentication selects. The result order is
/// stable for etag computation.
pub async fn fetch_secrets(
    api: &ApiClient,
    authentication: &Authentication,
    details: &AuthenticationDetails,
) -> Result<Vec<SecretVariable>> {
    let mut secrets = match details.strategy {
        AuthStrategy::ServiceToken => {
            let Some(auth) = &authentication.service_token else {
                return Err(Error::Auth("service token configuration missing".to_string()));
            };
            let token_details = api.get_service_token_details().await?;
            let scope = &auth.secrets_scope;
            api.get_secrets(
                &token_details.workspace,
                &scope.env_slug,
                &scope.secrets_path,
                scope.recursive,
            )
            .await?
        }
        AuthStrategy::ServiceAccount => {
            let Some(auth) = &authentication.service_account else {
                return Err(Error::Auth("service account configuration missing".to_string()));
            };
            api.get_secrets(&auth.project_id, &auth.environment_name, "/", false)
                .await?
        }
        AuthStrategy::UniversalAuth => {
            let scope = &details.machine_identity_scope;
            scope.validate()?;
            let project_id = resolve_project_id(api, scope).await?;
            match &scope.secret_name {
                Some(name) if !name.is_empty() => {
                    let secret = api
                        .get_secret(name, &project_id, &scope.env_slug, &scope.secrets_path)
                        .await?;
                    vec![secret]
                }
                _ => {
                    // Recursion is a fetch-side flag; the path is unchanged.
                    api.get_secrets(
                        &project_id,
                        &scope.env_slug,
                        &scope.secrets_path,
                        scope.recursive,
                    )
                    .await?
                }
            }
        }
    };

    secrets.sort_by(|a, b| (&a.secret_path, &a.key).cmp(&(&b.secret_path, &b.key)));
    Ok(secrets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_scope_check() {
        let confined = OperatorScope {
            namespace: Some("infisical-system".to_string()),
        };
        assert!(confined.check("infisical-system").is_ok());
        let err = confined.check("default").unwrap_err();
        assert!(matches!(err, Error::NamespaceScoped(_)));
        assert!(err.to_string().contains("namespace scoped"));

        assert!(OperatorScope::cluster_wide().check("anywhere").is_ok());
    }

    #[test]
    fn test_secret_value_extraction() {
        let secret = Secret {
            data: Some(
                [(
                    "clientId".to_string(),
                    k8s_openapi::ByteString(b"abc".to_vec()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        assert_eq!(secret_value(&secret, "clientId").unwrap(), "abc");
        assert!(matches!(
            secret_value(&secret, "missing"),
            Err(Error::Auth(_))
        ));
    }
}
