//! # Push Reconciler
//!
//! Reconciliation for `InfisicalPushSecret`: reads a cluster Secret and
//! pushes its entries up to Infisical. Machine identity is required; the
//! destination scope is the identity's secrets scope.

use crate::api::ApiClient;
use crate::config::{parse_resync_interval, GlobalConfig};
use crate::constants::PUSH_SECRETS_FINALIZER;
use crate::crd::{
    set_condition, Condition, ConditionStatus, InfisicalPushSecret, InfisicalPushSecretStatus,
    KubeSecretReference, MachineIdentityScope, PushDeletionPolicy,
};
use crate::error::{Error, Result};
use crate::secrets::{
    get_kube_secret, handle_authentication, resolve_ca_certificate, resolve_project_id,
    OperatorScope,
};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct PushReconciler {
    client: Client,
    global_config: GlobalConfig,
    operator_scope: OperatorScope,
}

impl PushReconciler {
    pub fn new(client: Client, global_config: GlobalConfig, operator_scope: OperatorScope) -> Self {
        Self {
            client,
            global_config,
            operator_scope,
        }
    }

    pub async fn reconcile(
        cr: Arc<InfisicalPushSecret>,
        ctx: Arc<PushReconciler>,
    ) -> std::result::Result<Action, Error> {
        let namespace = cr.namespace().ok_or_else(|| {
            Error::Config("InfisicalPushSecret is expected to be namespaced".to_string())
        })?;
        let api: Api<InfisicalPushSecret> = Api::namespaced(ctx.client.clone(), &namespace);

        finalizer(&api, PUSH_SECRETS_FINALIZER, cr, |event| async {
            match event {
                FinalizerEvent::Apply(cr) => ctx.apply(cr).await,
                FinalizerEvent::Cleanup(cr) => ctx.cleanup(cr).await,
            }
        })
        .await
        .map_err(|e| match e {
            FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
            FinalizerError::AddFinalizer(err) | FinalizerError::RemoveFinalizer(err) => {
                Error::Kube(err)
            }
            FinalizerError::UnnamedObject => {
                Error::Config("InfisicalPushSecret has no name".to_string())
            }
            FinalizerError::InvalidFinalizer => {
                Error::Config("invalid finalizer name".to_string())
            }
        })
    }

    pub fn error_policy(
        cr: Arc<InfisicalPushSecret>,
        error: &Error,
        _ctx: Arc<PushReconciler>,
    ) -> Action {
        error!(resource = %cr.name_any(), error = %error, "push reconciliation error");
        crate::observability::metrics::increment_reconciliation_errors();
        Action::requeue(Duration::from_secs(
            crate::constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
        ))
    }

    /// Build a client for this CR and authenticate it. Push has no event
    /// stream, so the client is not cached between reconciles.
    async fn authenticated_client(
        &self,
        cr: &InfisicalPushSecret,
    ) -> Result<(ApiClient, MachineIdentityScope)> {
        let host = self.global_config.resolve_host(cr.spec.host_api.as_deref());
        let ca_certificate = resolve_ca_certificate(
            &self.client,
            cr.spec.tls.as_ref(),
            &self.global_config,
            &self.operator_scope,
        )
        .await?;

        let api = ApiClient::new(host, ca_certificate.as_deref())?;
        let details = handle_authentication(
            &self.client,
            &api,
            &cr.spec.authentication,
            &self.operator_scope,
        )
        .await?;
        if !details.is_machine_identity() {
            return Err(Error::Config(
                "InfisicalPushSecret requires machine identity authentication".to_string(),
            ));
        }
        let scope = details.machine_identity_scope;
        scope.validate()?;
        Ok((api, scope))
    }

    async fn apply(&self, cr: Arc<InfisicalPushSecret>) -> Result<Action> {
        info!(resource = %cr.name_any(), "reconciling InfisicalPushSecret");
        crate::observability::metrics::increment_reconciliations();

        let result = self.apply_inner(&cr).await;
        if let Err(err) = &result {
            self.record_condition(
                &cr,
                Condition::new("Ready", ConditionStatus::False, "PushFailed", err.to_string()),
            )
            .await;
        }
        result
    }

    async fn apply_inner(&self, cr: &Arc<InfisicalPushSecret>) -> Result<Action> {
        let (api, scope) = self.authenticated_client(cr).await?;
        let project_id = resolve_project_id(&api, &scope).await?;

        let source = KubeSecretReference {
            secret_name: cr.spec.push.secret_name.clone(),
            secret_namespace: cr.spec.push.secret_namespace.clone(),
        };
        let source_secret = get_kube_secret(&self.client, &source, &self.operator_scope).await?;

        let entries: Vec<(String, String)> = source_secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, String::from_utf8_lossy(&value.0).into_owned()))
            .collect();

        if entries.is_empty() {
            warn!(
                secret = %format!("{}/{}", source.secret_namespace, source.secret_name),
                "source secret is empty, nothing to push"
            );
        } else {
            api.upsert_secrets(&project_id, &scope.env_slug, &scope.secrets_path, &entries)
                .await?;
            crate::observability::metrics::increment_secrets_pushed(entries.len() as i64);
        }

        let pushed_keys: Vec<String> = entries.into_iter().map(|(key, _)| key).collect();
        self.update_success_status(cr, pushed_keys).await?;

        match parse_resync_interval(cr.spec.resync_interval.as_deref())? {
            Some(interval) => Ok(Action::requeue(interval)),
            None => Ok(Action::await_change()),
        }
    }

    /// On deletion, remove pushed keys when the CR asked for it.
    async fn cleanup(&self, cr: Arc<InfisicalPushSecret>) -> Result<Action> {
        if cr.spec.deletion_policy != PushDeletionPolicy::Delete {
            return Ok(Action::await_change());
        }

        let pushed_keys = cr
            .status
            .as_ref()
            .map(|status| status.pushed_keys.clone())
            .unwrap_or_default();
        if pushed_keys.is_empty() {
            return Ok(Action::await_change());
        }

        let (api, scope) = self.authenticated_client(&cr).await?;
        let project_id = resolve_project_id(&api, &scope).await?;
        for key in &pushed_keys {
            if let Err(err) = api
                .delete_secret(key, &project_id, &scope.env_slug, &scope.secrets_path)
                .await
            {
                warn!(key = %key, error = %err, "failed to delete pushed secret");
            }
        }
        info!(count = pushed_keys.len(), "removed pushed secrets");
        Ok(Action::await_change())
    }

    async fn update_success_status(
        &self,
        cr: &Arc<InfisicalPushSecret>,
        pushed_keys: Vec<String>,
    ) -> Result<()> {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Ready",
                ConditionStatus::True,
                "PushSucceeded",
                format!("pushed {} secrets", pushed_keys.len()),
            ),
        );
        status.observed_generation = cr.metadata.generation;
        status.last_push_time = Some(chrono::Utc::now().to_rfc3339());
        status.pushed_keys = pushed_keys;
        self.patch_status(cr, status).await
    }

    async fn record_condition(&self, cr: &Arc<InfisicalPushSecret>, condition: Condition) {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(&mut status.conditions, condition);
        if let Err(err) = self.patch_status(cr, status).await {
            warn!(error = %err, "failed to update status condition");
        }
    }

    async fn patch_status(
        &self,
        cr: &Arc<InfisicalPushSecret>,
        status: InfisicalPushSecretStatus,
    ) -> Result<()> {
        let namespace = cr.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<InfisicalPushSecret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &cr.name_any(),
            &PatchParams::apply("infisical-operator"),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}
