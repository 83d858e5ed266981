//! # Infisical API Client
//!
//! REST client for the Infisical API, built per CR at authentication time.
//! The base URL and CA bundle are immutable for the life of the client; only
//! the access token rotates, so a stored subscribe operation always carries
//! the current token.

use crate::constants::USER_AGENT;
use crate::error::{Error, Result};
use crate::sse::is_permanent_error_message;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::debug;

/// One fetched secret.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVariable {
    #[serde(rename = "secretKey")]
    pub key: String,
    #[serde(rename = "secretValue")]
    pub value: String,
    #[serde(default)]
    pub secret_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTokenDetails {
    /// Project id the token is scoped to.
    pub workspace: String,
    #[serde(default)]
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountDetails {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretLease {
    pub id: String,
    pub expire_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSecretLeaseResponse {
    pub lease: DynamicSecretLease,
    /// Provider-specific credential material.
    pub data: std::collections::BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ProjectByIdResponse {
    workspace: Project,
}

#[derive(Deserialize)]
struct SecretsResponse {
    secrets: Vec<SecretVariable>,
}

#[derive(Deserialize)]
struct SecretResponse {
    secret: SecretVariable,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniversalAuthLoginResponse {
    access_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeCondition<'a> {
    secret_path: &'a str,
    environment_slug: &'a str,
}

#[derive(Serialize)]
struct SubscribeRegister<'a> {
    event: &'a str,
    conditions: &'a SubscribeCondition<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    project_id: &'a str,
    register: Vec<SubscribeRegister<'a>>,
}

/// Events the operator registers for on the project event stream.
const SUBSCRIBED_EVENTS: [&str; 4] = [
    "secret:create",
    "secret:update",
    "secret:delete",
    "secret:import-mutation",
];

/// Per-CR Infisical API client.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    /// Build a client for a resolved host. The optional CA certificate is
    /// added to the trust roots; it cannot change after construction.
    pub fn new(base_url: String, ca_certificate: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
        if let Some(pem) = ca_certificate {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| Error::Config(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_access_token(&self, token: String) {
        *self.token.write().expect("token lock poisoned") = Some(token);
    }

    pub fn access_token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.http.request(method, format!("{}{path}", self.base_url));
        if let Some(token) = self.access_token() {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// Exchange universal-auth credentials for an access token and store it
    /// on the client.
    pub async fn login_universal_auth(&self, client_id: &str, client_secret: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/v1/auth/universal-auth/login", self.base_url))
            .json(&serde_json::json!({
                "clientId": client_id,
                "clientSecret": client_secret,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let message = read_error_message(response).await;
            return Err(Error::Auth(format!(
                "universal auth login failed: {message}"
            )));
        }

        let login: UniversalAuthLoginResponse = response.json().await?;
        self.set_access_token(login.access_token);
        Ok(())
    }

    /// Authenticate subsequent requests with a legacy service token. Every
    /// space in the value is removed, interior included; a space is never a
    /// valid token character.
    pub fn login_service_token(&self, token: &str) {
        self.set_access_token(token.replace(' ', ""));
    }

    pub async fn get_project_by_id(&self, project_id: &str) -> Result<Project> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v1/workspace/{project_id}"))
            .send()
            .await?;
        let body: ProjectByIdResponse = check(response).await?.json().await?;
        Ok(body.workspace)
    }

    pub async fn get_project_by_slug(&self, project_slug: &str) -> Result<Project> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v2/workspace/{project_slug}"))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Resolve a project slug to its id.
    pub async fn extract_project_id_from_slug(&self, project_slug: &str) -> Result<String> {
        Ok(self.get_project_by_slug(project_slug).await?.id)
    }

    pub async fn get_service_token_details(&self) -> Result<ServiceTokenDetails> {
        let response = self
            .request(reqwest::Method::GET, "/v2/service-token")
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    pub async fn get_service_account_details(&self) -> Result<ServiceAccountDetails> {
        let response = self
            .request(reqwest::Method::GET, "/v2/service-accounts/me")
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Fetch every secret in scope. Recursion is a fetch-side flag; the
    /// secrets path is passed through unchanged.
    pub async fn get_secrets(
        &self,
        project_id: &str,
        env_slug: &str,
        secrets_path: &str,
        recursive: bool,
    ) -> Result<Vec<SecretVariable>> {
        let response = self
            .request(reqwest::Method::GET, "/v3/secrets/raw")
            .query(&[
                ("workspaceId", project_id),
                ("environment", env_slug),
                ("secretPath", secrets_path),
                ("recursive", if recursive { "true" } else { "false" }),
                ("include_imports", "true"),
            ])
            .send()
            .await?;
        let body: SecretsResponse = check(response).await?.json().await?;
        debug!(count = body.secrets.len(), "fetched secrets");
        Ok(body.secrets)
    }

    /// Fetch a single secret by name.
    pub async fn get_secret(
        &self,
        secret_name: &str,
        project_id: &str,
        env_slug: &str,
        secrets_path: &str,
    ) -> Result<SecretVariable> {
        let response = self
            .request(reqwest::Method::GET, &format!("/v3/secrets/raw/{secret_name}"))
            .query(&[
                ("workspaceId", project_id),
                ("environment", env_slug),
                ("secretPath", secrets_path),
            ])
            .send()
            .await?;
        let body: SecretResponse = check(response).await?.json().await?;
        Ok(body.secret)
    }

    /// Upsert a batch of secrets (push kind).
    pub async fn upsert_secrets(
        &self,
        project_id: &str,
        env_slug: &str,
        secrets_path: &str,
        secrets: &[(String, String)],
    ) -> Result<()> {
        let payload: Vec<_> = secrets
            .iter()
            .map(|(key, value)| {
                serde_json::json!({"secretKey": key, "secretValue": value})
            })
            .collect();
        let response = self
            .request(reqwest::Method::POST, "/v3/secrets/batch/raw")
            .json(&serde_json::json!({
                "workspaceId": project_id,
                "environment": env_slug,
                "secretPath": secrets_path,
                "secrets": payload,
            }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Delete a pushed secret.
    pub async fn delete_secret(
        &self,
        secret_name: &str,
        project_id: &str,
        env_slug: &str,
        secrets_path: &str,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                &format!("/v3/secrets/raw/{secret_name}"),
            )
            .json(&serde_json::json!({
                "workspaceId": project_id,
                "environment": env_slug,
                "secretPath": secrets_path,
            }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Create a dynamic-secret lease.
    pub async fn create_dynamic_secret_lease(
        &self,
        dynamic_secret_name: &str,
        project_slug: &str,
        env_slug: &str,
        secrets_path: &str,
        ttl: Option<&str>,
    ) -> Result<DynamicSecretLeaseResponse> {
        let mut body = serde_json::json!({
            "dynamicSecretName": dynamic_secret_name,
            "projectSlug": project_slug,
            "environmentSlug": env_slug,
            "path": secrets_path,
        });
        if let Some(ttl) = ttl {
            body["ttl"] = serde_json::Value::String(ttl.to_string());
        }
        let response = self
            .request(reqwest::Method::POST, "/v1/dynamic-secrets/leases")
            .json(&body)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Open the project event stream. The response body is an infinite SSE
    /// stream and is returned unparsed; error payloads are JSON
    /// `{"message": ...}`.
    pub async fn subscribe_project_events(
        &self,
        project_id: &str,
        secrets_path: &str,
        env_slug: &str,
    ) -> Result<reqwest::Response> {
        let conditions = SubscribeCondition {
            secret_path: secrets_path,
            environment_slug: env_slug,
        };
        let register: Vec<SubscribeRegister> = SUBSCRIBED_EVENTS
            .iter()
            .copied()
            .map(|event| SubscribeRegister {
                event,
                conditions: &conditions,
            })
            .collect();

        let response = self
            .request(reqwest::Method::POST, "/v1/events/subscribe/project-events")
            .header("Accept", "text/event-stream")
            .header("Connection", "keep-alive")
            .json(&SubscribeRequest {
                project_id,
                register,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let message = read_error_message(response).await;
            if status.is_server_error() && !is_permanent_error_message(&message) {
                return Err(Error::UpstreamTransient(message));
            }
            return Err(Error::UpstreamPermanent(message));
        }

        Ok(response)
    }
}

/// Map an unsuccessful response to the error taxonomy: 5xx is transient,
/// everything else is permanent until the spec changes.
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = read_error_message(response).await;
    if status.is_server_error() {
        Err(Error::UpstreamTransient(format!("[status={status}] {message}")))
    } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
    {
        Err(Error::Auth(format!("[status={status}] {message}")))
    } else {
        Err(Error::UpstreamPermanent(format!("[status={status}] {message}")))
    }
}

async fn read_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => format!("unsuccessful response [status={status}]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_variable_deserializes_api_shape() {
        let secret: SecretVariable = serde_json::from_value(serde_json::json!({
            "secretKey": "FOO",
            "secretValue": "1",
            "secretPath": "/app"
        }))
        .unwrap();
        assert_eq!(secret.key, "FOO");
        assert_eq!(secret.value, "1");
        assert_eq!(secret.secret_path, "/app");
    }

    #[test]
    fn test_subscribe_request_shape() {
        let conditions = SubscribeCondition {
            secret_path: "/app/**",
            environment_slug: "prod",
        };
        let request = SubscribeRequest {
            project_id: "p1",
            register: SUBSCRIBED_EVENTS
                .iter()
                .copied()
                .map(|event| SubscribeRegister {
                    event,
                    conditions: &conditions,
                })
                .collect(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["projectId"], "p1");
        let register = value["register"].as_array().unwrap();
        assert_eq!(register.len(), 4);
        assert_eq!(register[0]["event"], "secret:create");
        assert_eq!(register[3]["event"], "secret:import-mutation");
        assert_eq!(register[0]["conditions"]["secretPath"], "/app/**");
        assert_eq!(register[0]["conditions"]["environmentSlug"], "prod");
    }

    #[test]
    fn test_client_token_rotation() {
        let client = ApiClient::new("https://example.test/api".to_string(), None).unwrap();
        assert!(client.access_token().is_none());
        client.set_access_token("t1".to_string());
        assert_eq!(client.access_token().as_deref(), Some("t1"));
        client.login_service_token("st. with. spaces");
        assert_eq!(client.access_token().as_deref(), Some("st.with.spaces"));
    }
}
