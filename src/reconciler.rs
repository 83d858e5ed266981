//! # Reconciler
//!
//! Core reconciliation logic for `InfisicalSecret` resources.
//!
//! ## Reconciliation Flow
//!
//! 1. Resolve host/CA configuration and acquire the per-CR variables
//!    (authenticated client, cancellation root, stream registry)
//! 2. Authenticate once per CR and record the `TokenLoad` condition
//! 3. Fetch the secrets the CR's scope selects
//! 4. Render each managed descriptor and write the managed object
//! 5. Collect orphaned owned objects
//! 6. Update status, then (machine identity only) subscribe to the project
//!    event stream so upstream changes trigger instant reconciles

use crate::api::ApiClient;
use crate::config::{parse_resync_interval, GlobalConfig};
use crate::constants::SECRETS_FINALIZER;
use crate::crd::{
    set_condition, Condition, ConditionStatus, CreationPolicy, InfisicalSecret,
    InfisicalSecretStatus,
};
use crate::error::{Error, Result};
use crate::managed::{
    apply_managed_config_map, apply_managed_secret, compute_etag,
    delete_unreferenced_owned_resources,
};
use crate::observability::metrics;
use crate::resources::{AuthInputs, ResourceVariables, ResourceVariablesMap};
use crate::secrets::{
    fetch_secrets, handle_authentication, resolve_ca_certificate, resolve_project_id,
    OperatorScope,
};
use crate::sse::{ConnectionRegistry, OpenFn, RegistryCallbacks, SubscriptionParams};
use crate::template::render_managed_data;
use futures::channel::mpsc::UnboundedSender;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Synthetic reconcile trigger emitted by the event stream callbacks. The
/// controller consumes the stream with `reconcile_all_on`, so a fired
/// trigger re-runs every watched CR; unaffected resources no-op on their
/// etag check.
pub type TriggerSender = UnboundedSender<()>;

pub struct Reconciler {
    client: Client,
    global_config: GlobalConfig,
    operator_scope: OperatorScope,
    resources: ResourceVariablesMap,
    triggers: TriggerSender,
}

impl Reconciler {
    pub fn new(
        client: Client,
        global_config: GlobalConfig,
        operator_scope: OperatorScope,
        triggers: TriggerSender,
    ) -> Self {
        Self {
            client,
            global_config,
            operator_scope,
            resources: ResourceVariablesMap::new(),
            triggers,
        }
    }

    pub async fn reconcile(
        cr: Arc<InfisicalSecret>,
        ctx: Arc<Reconciler>,
    ) -> std::result::Result<Action, Error> {
        let namespace = cr.namespace().ok_or_else(|| {
            Error::Config("InfisicalSecret is expected to be namespaced".to_string())
        })?;
        let api: Api<InfisicalSecret> = Api::namespaced(ctx.client.clone(), &namespace);

        finalizer(&api, SECRETS_FINALIZER, cr, |event| async {
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
                Error::Config("InfisicalSecret has no name".to_string())
            }
            FinalizerError::InvalidFinalizer => {
                Error::Config("invalid finalizer name".to_string())
            }
        })
    }

    pub fn error_policy(cr: Arc<InfisicalSecret>, error: &Error, _ctx: Arc<Reconciler>) -> Action {
        error!(
            resource = %cr.name_any(),
            error = %error,
            "reconciliation error"
        );
        metrics::increment_reconciliation_errors();
        Action::requeue(Duration::from_secs(
            crate::constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS,
        ))
    }

    async fn apply(&self, cr: Arc<InfisicalSecret>) -> Result<Action> {
        let start = Instant::now();
        let name = cr.name_any();
        info!(resource = %name, "reconciling InfisicalSecret");
        metrics::increment_reconciliations();

        let result = self.apply_inner(&cr).await;
        match &result {
            Ok(_) => {
                metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
            }
            Err(err) => {
                self.record_ready_condition(&cr, ConditionStatus::False, "ReconcileFailed", err.to_string())
                    .await;
            }
        }
        result
    }

    async fn apply_inner(&self, cr: &Arc<InfisicalSecret>) -> Result<Action> {
        let variables = self.acquire_variables(cr).await?;

        let details = match variables.auth_details() {
            Some(details) => details,
            None => {
                info!("no cached authentication, authenticating");
                let result = handle_authentication(
                    &self.client,
                    &variables.api,
                    &cr.spec.authentication,
                    &self.operator_scope,
                )
                .await;
                self.record_token_load_condition(cr, &result).await;
                let details = result?;
                variables.set_auth_details(details.clone());
                details
            }
        };

        let secrets = fetch_secrets(&variables.api, &cr.spec.authentication, &details).await?;
        let secrets_count = secrets.len() as i32;

        let mut referenced_secrets = BTreeSet::new();
        for reference in &cr.spec.managed_kube_secret_references {
            if reference.creation_policy == CreationPolicy::Owner {
                referenced_secrets.insert(format!(
                    "{}/{}",
                    reference.secret_namespace, reference.secret_name
                ));
            }
            let rendered = render_managed_data(reference.template.as_ref(), &secrets)?;
            let etag = compute_etag(&rendered);
            apply_managed_secret(&self.client, cr.as_ref(), reference, &rendered, &etag).await?;
        }

        let mut referenced_config_maps = BTreeSet::new();
        for reference in &cr.spec.managed_kube_config_map_references {
            if reference.creation_policy == CreationPolicy::Owner {
                referenced_config_maps.insert(format!(
                    "{}/{}",
                    reference.config_map_namespace, reference.config_map_name
                ));
            }
            let rendered = render_managed_data(reference.template.as_ref(), &secrets)?;
            let etag = compute_etag(&rendered);
            apply_managed_config_map(&self.client, cr.as_ref(), reference, &rendered, &etag).await?;
        }

        delete_unreferenced_owned_resources(
            &self.client,
            cr.as_ref(),
            &referenced_secrets,
            &referenced_config_maps,
        )
        .await;

        self.update_success_status(cr, secrets_count).await?;
        metrics::increment_secrets_pulled(i64::from(secrets_count));

        if details.is_machine_identity() {
            if let Err(err) = self.open_instant_updates_stream(cr, &variables).await {
                warn!(error = %err, "instant updates unavailable, relying on periodic resync");
            }
        }

        info!(secrets = secrets_count, "reconciliation complete");
        match parse_resync_interval(cr.spec.resync_interval.as_deref())? {
            Some(interval) => Ok(Action::requeue(interval)),
            None => Ok(Action::await_change()),
        }
    }

    async fn cleanup(&self, cr: Arc<InfisicalSecret>) -> Result<Action> {
        let name = cr.name_any();
        info!(resource = %name, "cleaning up InfisicalSecret");
        if let Some(uid) = cr.uid() {
            if let Some(variables) = self.resources.get(&uid).await {
                if variables.stream.is_connected().await {
                    metrics::stream_closed();
                }
            }
            self.resources.remove(&uid).await;
        }
        Ok(Action::await_change())
    }

    /// Acquire (or rebuild after an auth-affecting spec change) the per-CR
    /// variables entry.
    async fn acquire_variables(&self, cr: &Arc<InfisicalSecret>) -> Result<Arc<ResourceVariables>> {
        let uid = cr
            .uid()
            .ok_or_else(|| Error::Config("InfisicalSecret has no UID".to_string()))?;

        let host = self.global_config.resolve_host(cr.spec.host_api.as_deref());
        let ca_certificate = resolve_ca_certificate(
            &self.client,
            cr.spec.tls.as_ref(),
            &self.global_config,
            &self.operator_scope,
        )
        .await?;

        let inputs = AuthInputs {
            host_api: cr.spec.host_api.clone(),
            authentication: cr.spec.authentication.clone(),
            tls: cr.spec.tls.clone(),
        };

        let object_ref = ObjectRef::from_obj(cr.as_ref());
        let triggers = self.triggers.clone();
        self.resources
            .acquire(&uid, inputs, move |_cancel_root| {
                let api = Arc::new(ApiClient::new(host, ca_certificate.as_deref())?);
                let stream = Arc::new(ConnectionRegistry::new(Self::registry_callbacks(
                    object_ref, triggers,
                )));
                Ok((api, stream))
            })
            .await
    }

    /// The registry reports back through callbacks; both a received change
    /// event and exhausted reconnects enqueue a synthetic reconcile.
    fn registry_callbacks(
        object_ref: ObjectRef<InfisicalSecret>,
        triggers: TriggerSender,
    ) -> RegistryCallbacks {
        let event_ref = object_ref.clone();
        let event_triggers = triggers.clone();
        let reconnect_ref = object_ref.clone();

        RegistryCallbacks {
            on_event: Arc::new(move |event| {
                info!(
                    resource = %event_ref,
                    event = %event.event,
                    "received project event, triggering reconcile"
                );
                if event_triggers.unbounded_send(()).is_err() {
                    warn!("reconcile trigger channel closed");
                }
            }),
            on_error: Arc::new(move |err| {
                warn!(resource = %object_ref, error = %err, "event stream error");
            }),
            on_reconnect: Arc::new(move || {
                metrics::increment_stream_reconnects();
                warn!(
                    resource = %reconnect_ref,
                    "event stream reconnects exhausted, forcing full reconcile"
                );
                if triggers.unbounded_send(()).is_err() {
                    warn!("reconcile trigger channel closed");
                }
            }),
        }
    }

    /// Subscribe to the project event stream with the CR's current scope.
    /// The subscribe path carries the recursive `**` suffix; fetches do not.
    async fn open_instant_updates_stream(
        &self,
        cr: &Arc<InfisicalSecret>,
        variables: &Arc<ResourceVariables>,
    ) -> Result<()> {
        let details = variables
            .auth_details()
            .ok_or_else(|| Error::Auth("not authenticated".to_string()))?;
        if !details.is_machine_identity() {
            return Err(Error::Config(
                "only machine identity auth supports instant updates".to_string(),
            ));
        }

        let scope = &details.machine_identity_scope;
        scope.validate()?;
        let project_id = resolve_project_id(&variables.api, scope).await?;

        let mut subscribe_path = scope.secrets_path.clone();
        if scope.recursive {
            subscribe_path.push_str("**");
        }

        let params = SubscriptionParams {
            project_id: project_id.clone(),
            env_slug: scope.env_slug.clone(),
            secrets_path: subscribe_path.clone(),
        };

        let api = variables.api.clone();
        let env_slug = scope.env_slug.clone();
        let open: OpenFn = Arc::new(move || {
            let api = api.clone();
            let project_id = project_id.clone();
            let subscribe_path = subscribe_path.clone();
            let env_slug = env_slug.clone();
            Box::pin(async move {
                api.subscribe_project_events(&project_id, &subscribe_path, &env_slug)
                    .await
            })
        });

        let was_connected = variables.stream.is_connected().await;
        variables.stream.subscribe_with_params(params, open).await?;
        if !was_connected && variables.stream.is_connected().await {
            metrics::stream_opened();
        }
        Ok(())
    }

    async fn record_token_load_condition(
        &self,
        cr: &Arc<InfisicalSecret>,
        result: &Result<crate::crd::AuthenticationDetails>,
    ) {
        let condition = match result {
            Ok(details) => Condition::new(
                "TokenLoad",
                ConditionStatus::True,
                "Authenticated",
                format!("authenticated via {}", details.strategy.as_str()),
            ),
            Err(err) => Condition::new(
                "TokenLoad",
                ConditionStatus::False,
                "AuthenticationFailed",
                err.to_string(),
            ),
        };
        self.patch_condition(cr, condition).await;
    }

    async fn record_ready_condition(
        &self,
        cr: &Arc<InfisicalSecret>,
        status: ConditionStatus,
        reason: &str,
        message: String,
    ) {
        self.patch_condition(cr, Condition::new("Ready", status, reason, message))
            .await;
    }

    /// Best-effort condition patch; status failures never fail a reconcile
    /// on their own.
    async fn patch_condition(&self, cr: &Arc<InfisicalSecret>, condition: Condition) {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(&mut status.conditions, condition);
        if let Err(err) = self.patch_status(cr, status).await {
            warn!(error = %err, "failed to update status condition");
        }
    }

    async fn update_success_status(&self, cr: &Arc<InfisicalSecret>, secrets_count: i32) -> Result<()> {
        let mut status = cr.status.clone().unwrap_or_default();
        set_condition(
            &mut status.conditions,
            Condition::new(
                "Ready",
                ConditionStatus::True,
                "ReconcileSucceeded",
                format!("synced {secrets_count} secrets"),
            ),
        );
        status.observed_generation = cr.metadata.generation;
        status.last_reconcile_time = Some(chrono::Utc::now().to_rfc3339());
        status.secrets_synced = Some(secrets_count);
        self.patch_status(cr, status).await
    }

    async fn patch_status(&self, cr: &Arc<InfisicalSecret>, status: InfisicalSecretStatus) -> Result<()> {
        let namespace = cr.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<InfisicalSecret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &cr.name_any(),
            &PatchParams::apply("infisical-operator"),
            &Patch::Merge(serde_json::json!({ "status": status })),
        )
        .await?;
        Ok(())
    }
}
