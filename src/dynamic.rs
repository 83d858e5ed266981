//! # Dynamic Secret Reconciler
//!
//! Reconciliation for `InfisicalDynamicSecret`: creates a dynamic-secret
//! lease and writes the credential material into a managed Secret. Renewal
//! rides the controller requeue; the CR is reconciled again at roughly two
//! thirds of the lease lifetime and takes a fresh lease.

use crate::api::{ApiClient, SecretVariable};
use crate::config::GlobalConfig;
use crate::crd::{
    set_condition, Condition, ConditionStatus, CreationPolicy, InfisicalDynamicSecret,
    InfisicalDynamicSecretStatus,
};
use crate::error::{Error, Result};
use crate::managed::{apply_managed_secret, compute_etag};
use crate::secrets::{handle_authentication, resolve_ca_certificate, OperatorScope};
use crate::template::render_managed_data;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Fallback requeue when the lease expiry cannot be parsed.
const DEFAULT_LEASE_REQUEUE: Duration = Duration::from_secs(60);

pub struct DynamicReconciler {
    client: Client,
    global_config: GlobalConfig,
    operator_scope: OperatorScope,
}

impl DynamicReconciler {
    pub fn new(client: Client, global_config: GlobalConfig, operator_scope: OperatorScope) -> Self {
        Self {
            client,
            global_config,
            operator_scope,
        }
    }

    pub async fn reconcile(
        cr: Arc<InfisicalDynamicSecret>,
        ctx: Arc<DynamicReconciler>,
    ) -> std::result::Result<Action, Error> {
        info!(resource = %cr.name_any(), "reconciling InfisicalDynamicSecret");
        crate::observability::metrics::increment_reconciliations();

        let result = ctx.apply(&cr).await;
        if let Err(err) = &result {
            ctx.record_condition(
                &cr,
                Condition::new("Ready", ConditionStatus::False, "LeaseFailed", err.to_string()),
            )
            .await;
        }
        result
    }

    pub fn error_policy(
        cr: Arc<InfisicalDynamicSecret>,
        error: &Error,
        _ctx: Arc<DynamicReconciler>,
    ) -> Action {
        error!(resource = %cr.name_any(), error = %error, "dynamic secret reconciliation error");
        crate::observability::metrics::increment_reconciliation_errors();
        Action::requeue(Duration::from_secs(
            crate::constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
        ))
    }

    async fn apply(&self, cr: &Arc<InfisicalDynamicSecret>) -> Result<Action> {
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
                "InfisicalDynamicSecret requires machine identity authentication".to_string(),
            ));
        }
        let scope = details.machine_identity_scope;
        scope.validate()?;
        if scope.project_slug.is_empty() {
            return Err(Error::InvalidScope(
                "dynamic secret leases are addressed by projectSlug".to_string(),
            ));
        }

        let lease = api
            .create_dynamic_secret_lease(
                &cr.spec.dynamic_secret_name,
                &scope.project_slug,
                &scope.env_slug,
                &scope.secrets_path,
                cr.spec.lease_ttl.as_deref(),
            )
            .await?;

        let credentials: Vec<SecretVariable> = lease
            .data
            .iter()
            .map(|(key, value)| SecretVariable {
                key: key.clone(),
                value: value.clone(),
                secret_path: scope.secrets_path.clone(),
            })
            .collect();

        let reference = &cr.spec.managed_secret_reference;
        let rendered = render_managed_data(reference.template.as_ref(), &credentials)?;
        let etag = compute_etag(&rendered);
        apply_managed_secret(&self.client, cr.as_ref(), reference, &rendered, &etag).await?;
        if reference.creation_policy == CreationPolicy::Orphan {
            warn!("dynamic secret credentials written with Orphan policy; they will outlive the CR");
        }

        self.update_success_status(cr, &lease.lease.id, &lease.lease.expire_at)
            .await?;

        Ok(Action::requeue(requeue_before_expiry(&lease.lease.expire_at)))
    }

    async fn update_success_status(
        &self,
        cr: &Arc<InfisicalDynamicSecret>,
        lease_id: &str,
        expires_at: &str,
    ) -> Result<()> {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Ready",
                ConditionStatus::True,
                "LeaseCreated",
                format!("lease {lease_id} active until {expires_at}"),
            ),
        );
        status.lease_id = Some(lease_id.to_string());
        status.lease_expires_at = Some(expires_at.to_string());
        self.patch_status(cr, status).await
    }

    async fn record_condition(&self, cr: &Arc<InfisicalDynamicSecret>, condition: Condition) {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(&mut status.conditions, condition);
        if let Err(err) = self.patch_status(cr, status).await {
            warn!(error = %err, "failed to update status condition");
        }
    }

    async fn patch_status(
        &self,
        cr: &Arc<InfisicalDynamicSecret>,
        status: InfisicalDynamicSecretStatus,
    ) -> Result<()> {
        let namespace = cr.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<InfisicalDynamicSecret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &cr.name_any(),
            &PatchParams::apply("infisical-operator"),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}

/// Requeue at two thirds of the remaining lease lifetime, clamped to at
/// least five seconds.
fn requeue_before_expiry(expires_at: &str) -> Duration {
    let Ok(expiry) = chrono::DateTime::parse_from_rfc3339(expires_at) else {
        return DEFAULT_LEASE_REQUEUE;
    };
    let remaining = expiry.with_timezone(&chrono::Utc) - chrono::Utc::now();
    let remaining_secs = remaining.num_seconds().max(0) as u64;
    Duration::from_secs((remaining_secs * 2 / 3).max(5))
}
