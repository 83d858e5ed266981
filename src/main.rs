//! Operator entrypoint: wires logging, metrics, the probe server, and the
//! three controllers together.

use anyhow::{Context, Result};
use futures::StreamExt;
use infisical_operator::config::GlobalConfig;
use infisical_operator::constants::{DEFAULT_METRICS_PORT, GLOBAL_CONFIG_MAP_NAME};
use infisical_operator::crd::{InfisicalDynamicSecret, InfisicalPushSecret, InfisicalSecret};
use infisical_operator::dynamic::DynamicReconciler;
use infisical_operator::observability::metrics;
use infisical_operator::push::PushReconciler;
use infisical_operator::reconciler::Reconciler;
use infisical_operator::secrets::OperatorScope;
use infisical_operator::server::{serve, OperatorHealth};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "infisical_operator=info".into()),
        )
        .init();

    info!("Starting Infisical Secrets Operator");

    metrics::register_metrics()?;

    let health = OperatorHealth::new();
    let server_port = std::env::var("METRICS_PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_METRICS_PORT);
    let server_health = health.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(server_port, server_health).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default().await?;

    // WATCH_NAMESPACE confines the operator to a single namespace; unset
    // means cluster wide.
    let operator_scope = match std::env::var("WATCH_NAMESPACE") {
        Ok(namespace) if !namespace.is_empty() => OperatorScope {
            namespace: Some(namespace),
        },
        _ => OperatorScope::cluster_wide(),
    };

    let operator_namespace =
        std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "infisical-operator-system".to_string());
    let global_config = load_global_config(&client, &operator_namespace)
        .await
        .context("failed to load operator config map")?;

    let secrets_api: Api<InfisicalSecret> = match &operator_scope.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let push_api: Api<InfisicalPushSecret> = match &operator_scope.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    let dynamic_api: Api<InfisicalDynamicSecret> = match &operator_scope.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    // Synthetic reconcile triggers from the event stream registries fan into
    // the pull controller's queue.
    let (trigger_tx, trigger_rx) = futures::channel::mpsc::unbounded();

    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        global_config.clone(),
        operator_scope.clone(),
        trigger_tx,
    ));
    let push_reconciler = Arc::new(PushReconciler::new(
        client.clone(),
        global_config.clone(),
        operator_scope.clone(),
    ));
    let dynamic_reconciler = Arc::new(DynamicReconciler::new(
        client.clone(),
        global_config,
        operator_scope,
    ));

    health.mark_ready();

    let pull_controller = Controller::new(secrets_api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .reconcile_all_on(trigger_rx)
        .run(
            Reconciler::reconcile,
            Reconciler::error_policy,
            reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled {:?}", obj),
                Err(e) => warn!("reconciliation error: {:?}", e),
            }
        });

    let push_controller = Controller::new(push_api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            PushReconciler::reconcile,
            PushReconciler::error_policy,
            push_reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled {:?}", obj),
                Err(e) => warn!("push reconciliation error: {:?}", e),
            }
        });

    let dynamic_controller = Controller::new(dynamic_api, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            DynamicReconciler::reconcile,
            DynamicReconciler::error_policy,
            dynamic_reconciler,
        )
        .for_each(|result| async move {
            match result {
                Ok(obj) => debug!("reconciled {:?}", obj),
                Err(e) => warn!("dynamic reconciliation error: {:?}", e),
            }
        });

    tokio::join!(pull_controller, push_controller, dynamic_controller);

    health.mark_not_ready();
    info!("Operator stopped");
    Ok(())
}

async fn load_global_config(client: &Client, namespace: &str) -> Result<GlobalConfig> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(GLOBAL_CONFIG_MAP_NAME).await? {
        Some(config_map) => {
            let config = GlobalConfig::parse(&config_map.data.unwrap_or_default())?;
            info!(
                host = config.host_api.as_deref().unwrap_or("default"),
                "loaded operator config map"
            );
            Ok(config)
        }
        None => {
            info!("no operator config map found, using defaults");
            Ok(GlobalConfig::default())
        }
    }
}
