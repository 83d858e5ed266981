//! # Managed Objects
//!
//! Writes fetched secrets into managed cluster objects (opaque Secrets and
//! ConfigMaps), reconciles labels/annotations with a three-way merge against
//! the tracking annotations, and collects orphaned objects the CR no longer
//! references.

use crate::constants::{
    MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION, SECRET_VERSION_ANNOTATION,
    SYSTEM_PREFIXES,
};
use crate::crd::{CreationPolicy, ManagedKubeConfigMapConfig, ManagedKubeSecretConfig};
use crate::error::Result;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, ObjectList, PostParams};
use kube::{Client, Resource, ResourceExt};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{error, info, warn};

/// Deterministic content hash over the rendered output map. BTreeMap
/// iteration gives the stable key ordering the etag depends on.
pub fn compute_etag(rendered: &BTreeMap<String, Vec<u8>>) -> String {
    let mut context = md5::Context::new();
    for (key, value) in rendered {
        context.consume(key.as_bytes());
        context.consume(b"=");
        context.consume(value);
        context.consume(b"\n");
    }
    format!("{:x}", context.compute())
}

fn is_system_key(key: &str) -> bool {
    SYSTEM_PREFIXES.iter().any(|prefix| key.starts_with(prefix))
}

/// Parse a tracking annotation back into the set of managed keys.
pub fn parse_managed_keys(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

/// Format a key set for a tracking annotation: sorted, comma separated.
pub fn format_managed_keys(keys: &BTreeSet<String>) -> String {
    keys.iter().cloned().collect::<Vec<_>>().join(",")
}

/// Three-way label/annotation sync.
///
/// Entries the operator previously managed but the CR no longer declares are
/// removed; entries added out-of-band are preserved; the CR's current
/// labels/annotations are reasserted; the tracking annotations are refreshed
/// to the CR's current key sets. System-prefixed annotations and the
/// operator's own markers always survive.
pub fn sync_labels_and_annotations<K: Resource>(
    cr: &K,
    existing_labels: &BTreeMap<String, String>,
    existing_annotations: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let previously_managed_labels = existing_annotations
        .get(MANAGED_LABELS_ANNOTATION)
        .map(|v| parse_managed_keys(v))
        .unwrap_or_default();
    let previously_managed_annotations = existing_annotations
        .get(MANAGED_ANNOTATIONS_ANNOTATION)
        .map(|v| parse_managed_keys(v))
        .unwrap_or_default();

    let cr_labels = cr.labels();
    let cr_annotations = cr.annotations();

    let managed_label_keys: BTreeSet<String> = cr_labels.keys().cloned().collect();
    let managed_annotation_keys: BTreeSet<String> = cr_annotations
        .keys()
        .filter(|key| !is_system_key(key))
        .cloned()
        .collect();

    let mut labels = BTreeMap::new();
    for (key, value) in existing_labels {
        if !previously_managed_labels.contains(key) {
            labels.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in cr_labels {
        labels.insert(key.clone(), value.clone());
    }

    let mut annotations = BTreeMap::new();
    for (key, value) in existing_annotations {
        let engine_owned = key == SECRET_VERSION_ANNOTATION
            || key == MANAGED_LABELS_ANNOTATION
            || key == MANAGED_ANNOTATIONS_ANNOTATION;
        if engine_owned || is_system_key(key) || !previously_managed_annotations.contains(key) {
            annotations.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in cr_annotations {
        if !is_system_key(key) {
            annotations.insert(key.clone(), value.clone());
        }
    }

    annotations.insert(
        MANAGED_LABELS_ANNOTATION.to_string(),
        format_managed_keys(&managed_label_keys),
    );
    annotations.insert(
        MANAGED_ANNOTATIONS_ANNOTATION.to_string(),
        format_managed_keys(&managed_annotation_keys),
    );

    (labels, annotations)
}

fn owner_references<K: Resource<DynamicType = ()>>(
    cr: &K,
    policy: CreationPolicy,
) -> Option<Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>> {
    match policy {
        CreationPolicy::Owner => cr.controller_owner_ref(&()).map(|r| vec![r]),
        CreationPolicy::Orphan => None,
    }
}

fn convert_to_string_map(data: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    data.iter()
        .map(|(key, value)| (key.clone(), String::from_utf8_lossy(value).into_owned()))
        .collect()
}

/// Create or update the managed Secret for one descriptor.
pub async fn apply_managed_secret<K: Resource<DynamicType = ()>>(
    client: &Client,
    cr: &K,
    reference: &ManagedKubeSecretConfig,
    rendered: &BTreeMap<String, Vec<u8>>,
    etag: &str,
) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client.clone(), &reference.secret_namespace);
    let existing = api.get_opt(&reference.secret_name).await?;

    let (labels, mut annotations) = match &existing {
        Some(secret) => sync_labels_and_annotations(
            cr,
            secret.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
            secret.metadata.annotations.as_ref().unwrap_or(&BTreeMap::new()),
        ),
        None => sync_labels_and_annotations(cr, &BTreeMap::new(), &BTreeMap::new()),
    };
    annotations.insert(SECRET_VERSION_ANNOTATION.to_string(), etag.to_string());

    let data: BTreeMap<String, ByteString> = rendered
        .iter()
        .map(|(key, value)| (key.clone(), ByteString(value.clone())))
        .collect();

    match existing {
        None => {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(reference.secret_name.clone()),
                    namespace: Some(reference.secret_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(annotations),
                    owner_references: owner_references(cr, reference.creation_policy),
                    ..Default::default()
                },
                type_: Some(
                    reference
                        .secret_type
                        .clone()
                        .unwrap_or_else(|| "Opaque".to_string()),
                ),
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &secret).await?;
            info!(
                secret = %format!("{}/{}", reference.secret_namespace, reference.secret_name),
                "created managed secret"
            );
        }
        Some(mut secret) => {
            let unchanged = secret
                .annotations()
                .get(SECRET_VERSION_ANNOTATION)
                .is_some_and(|stored| stored == etag)
                && secret.metadata.labels.as_ref() == Some(&labels)
                && secret.metadata.annotations.as_ref() == Some(&annotations);
            if unchanged {
                return Ok(());
            }
            secret.metadata.labels = Some(labels);
            secret.metadata.annotations = Some(annotations);
            secret.data = Some(data);
            secret.string_data = None;
            api.replace(&reference.secret_name, &PostParams::default(), &secret)
                .await?;
            info!(
                secret = %format!("{}/{}", reference.secret_namespace, reference.secret_name),
                "updated managed secret"
            );
        }
    }

    Ok(())
}

/// Create or update the managed ConfigMap for one descriptor.
pub async fn apply_managed_config_map<K: Resource<DynamicType = ()>>(
    client: &Client,
    cr: &K,
    reference: &ManagedKubeConfigMapConfig,
    rendered: &BTreeMap<String, Vec<u8>>,
    etag: &str,
) -> Result<()> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), &reference.config_map_namespace);
    let existing = api.get_opt(&reference.config_map_name).await?;

    let (labels, mut annotations) = match &existing {
        Some(config_map) => sync_labels_and_annotations(
            cr,
            config_map.metadata.labels.as_ref().unwrap_or(&BTreeMap::new()),
            config_map
                .metadata
                .annotations
                .as_ref()
                .unwrap_or(&BTreeMap::new()),
        ),
        None => sync_labels_and_annotations(cr, &BTreeMap::new(), &BTreeMap::new()),
    };
    annotations.insert(SECRET_VERSION_ANNOTATION.to_string(), etag.to_string());

    let data = convert_to_string_map(rendered);

    match existing {
        None => {
            let config_map = ConfigMap {
                metadata: ObjectMeta {
                    name: Some(reference.config_map_name.clone()),
                    namespace: Some(reference.config_map_namespace.clone()),
                    labels: Some(labels),
                    annotations: Some(annotations),
                    owner_references: owner_references(cr, reference.creation_policy),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &config_map).await?;
            info!(
                config_map = %format!("{}/{}", reference.config_map_namespace, reference.config_map_name),
                "created managed config map"
            );
        }
        Some(mut config_map) => {
            let unchanged = config_map
                .annotations()
                .get(SECRET_VERSION_ANNOTATION)
                .is_some_and(|stored| stored == etag)
                && config_map.metadata.labels.as_ref() == Some(&labels)
                && config_map.metadata.annotations.as_ref() == Some(&annotations);
            if unchanged {
                return Ok(());
            }
            config_map.metadata.labels = Some(labels);
            config_map.metadata.annotations = Some(annotations);
            config_map.data = Some(data);
            api.replace(&reference.config_map_name, &PostParams::default(), &config_map)
                .await?;
            info!(
                config_map = %format!("{}/{}", reference.config_map_namespace, reference.config_map_name),
                "updated managed config map"
            );
        }
    }

    Ok(())
}

fn is_owned_by(
    owner_references: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference],
    cr_uid: &str,
    cr_kind: &str,
) -> bool {
    owner_references
        .iter()
        .any(|reference| reference.uid == cr_uid && reference.kind == cr_kind)
}

/// Delete managed objects owned by this CR that are no longer referenced
/// with `Owner` policy. Best effort: failures are logged and retried on the
/// next pass.
pub async fn delete_unreferenced_owned_resources<K: Resource<DynamicType = ()>>(
    client: &Client,
    cr: &K,
    referenced_secrets: &BTreeSet<String>,
    referenced_config_maps: &BTreeSet<String>,
) {
    let Some(namespace) = cr.namespace() else {
        return;
    };
    let Some(uid) = cr.uid() else {
        return;
    };
    let cr_kind = K::kind(&());

    let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
    match secrets.list(&ListParams::default()).await {
        Ok(list) => {
            delete_orphans(&secrets, &list, &uid, &cr_kind, referenced_secrets, "secret").await;
        }
        Err(err) => error!(error = %err, "failed to list secrets for cleanup"),
    }

    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), &namespace);
    match config_maps.list(&ListParams::default()).await {
        Ok(list) => {
            delete_orphans(
                &config_maps,
                &list,
                &uid,
                &cr_kind,
                referenced_config_maps,
                "config map",
            )
            .await;
        }
        Err(err) => error!(error = %err, "failed to list config maps for cleanup"),
    }
}

async fn delete_orphans<K>(
    api: &Api<K>,
    list: &ObjectList<K>,
    cr_uid: &str,
    cr_kind: &str,
    referenced: &BTreeSet<String>,
    kind: &str,
) where
    K: Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    for object in &list.items {
        let owner_references = object.meta().owner_references.as_deref().unwrap_or(&[]);
        if !is_owned_by(owner_references, cr_uid, cr_kind) {
            continue;
        }
        let key = format!(
            "{}/{}",
            object.meta().namespace.as_deref().unwrap_or_default(),
            object.meta().name.as_deref().unwrap_or_default()
        );
        if referenced.contains(&key) {
            continue;
        }
        info!(%key, "deleting orphaned owned {kind}");
        if let Err(err) = api
            .delete(object.meta().name.as_deref().unwrap_or_default(), &DeleteParams::default())
            .await
        {
            warn!(%key, error = %err, "failed to delete orphaned owned {kind}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Authentication, InfisicalSecret, InfisicalSecretSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn map(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn cr_with_metadata(
        labels: &[(&str, &str)],
        annotations: &[(&str, &str)],
    ) -> InfisicalSecret {
        let mut cr = InfisicalSecret::new(
            "example",
            InfisicalSecretSpec {
                host_api: None,
                tls: None,
                authentication: Authentication::default(),
                resync_interval: None,
                managed_kube_secret_references: Vec::new(),
                managed_kube_config_map_references: Vec::new(),
            },
        );
        cr.metadata.labels = Some(map(labels));
        cr.metadata.annotations = Some(map(annotations));
        cr
    }

    #[test]
    fn test_etag_deterministic_across_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("FOO".to_string(), b"1".to_vec());
        a.insert("BAR".to_string(), b"2".to_vec());
        let mut b = BTreeMap::new();
        b.insert("BAR".to_string(), b"2".to_vec());
        b.insert("FOO".to_string(), b"1".to_vec());
        assert_eq!(compute_etag(&a), compute_etag(&b));
        assert!(!compute_etag(&a).is_empty());
    }

    #[test]
    fn test_etag_changes_with_content() {
        let mut a = BTreeMap::new();
        a.insert("FOO".to_string(), b"1".to_vec());
        let mut b = BTreeMap::new();
        b.insert("FOO".to_string(), b"2".to_vec());
        assert_ne!(compute_etag(&a), compute_etag(&b));
    }

    #[test]
    fn test_parse_and_format_managed_keys() {
        let keys = parse_managed_keys("team, tier ,,owner");
        assert_eq!(keys.len(), 3);
        assert_eq!(format_managed_keys(&keys), "owner,team,tier");
        assert!(parse_managed_keys("").is_empty());
        assert_eq!(format_managed_keys(&BTreeSet::new()), "");
    }

    #[test]
    fn test_first_write_records_managed_keys() {
        let cr = cr_with_metadata(&[("team", "a")], &[("note", "hello")]);
        let (labels, annotations) =
            sync_labels_and_annotations(&cr, &BTreeMap::new(), &BTreeMap::new());

        assert_eq!(labels, map(&[("team", "a")]));
        assert_eq!(annotations.get("note").map(String::as_str), Some("hello"));
        assert_eq!(
            annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
            Some("team")
        );
        assert_eq!(
            annotations
                .get(MANAGED_ANNOTATIONS_ANNOTATION)
                .map(String::as_str),
            Some("note")
        );
    }

    #[test]
    fn test_label_drift_scenario() {
        // First reconcile with {team:a}; a human adds {owner:ops} out of
        // band; second reconcile declares {team:a, tier:gold}.
        let first = cr_with_metadata(&[("team", "a")], &[]);
        let (labels, annotations) =
            sync_labels_and_annotations(&first, &BTreeMap::new(), &BTreeMap::new());

        let mut drifted = labels.clone();
        drifted.insert("owner".to_string(), "ops".to_string());

        let second = cr_with_metadata(&[("team", "a"), ("tier", "gold")], &[]);
        let (labels, annotations) = sync_labels_and_annotations(&second, &drifted, &annotations);

        assert_eq!(
            labels,
            map(&[("team", "a"), ("tier", "gold"), ("owner", "ops")])
        );
        assert_eq!(
            annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
            Some("team,tier")
        );
    }

    #[test]
    fn test_removed_managed_label_is_dropped() {
        let first = cr_with_metadata(&[("team", "a"), ("tier", "gold")], &[]);
        let (labels, annotations) =
            sync_labels_and_annotations(&first, &BTreeMap::new(), &BTreeMap::new());

        let second = cr_with_metadata(&[("team", "a")], &[]);
        let (labels, annotations) = sync_labels_and_annotations(&second, &labels, &annotations);

        assert_eq!(labels, map(&[("team", "a")]));
        assert_eq!(
            annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
            Some("team")
        );
    }

    #[test]
    fn test_removed_managed_annotation_is_dropped_foreign_preserved() {
        let first = cr_with_metadata(&[], &[("app.example/team", "a")]);
        let (_, annotations) =
            sync_labels_and_annotations(&first, &BTreeMap::new(), &BTreeMap::new());

        let mut existing = annotations.clone();
        existing.insert("human.example/note".to_string(), "keep me".to_string());

        let second = cr_with_metadata(&[], &[]);
        let (_, annotations) = sync_labels_and_annotations(&second, &BTreeMap::new(), &existing);

        assert!(!annotations.contains_key("app.example/team"));
        assert_eq!(
            annotations.get("human.example/note").map(String::as_str),
            Some("keep me")
        );
    }

    #[test]
    fn test_system_prefixed_annotations_never_managed() {
        let cr = cr_with_metadata(
            &[],
            &[
                ("kubectl.kubernetes.io/last-applied-configuration", "{}"),
                ("helm.sh/release", "r1"),
                ("app.example/mine", "v"),
            ],
        );
        let existing = map(&[("kubernetes.io/foo", "bar")]);
        let (_, annotations) = sync_labels_and_annotations(&cr, &BTreeMap::new(), &existing);

        // System annotations pass through untouched and stay out of the
        // tracking annotation.
        assert_eq!(
            annotations.get("kubernetes.io/foo").map(String::as_str),
            Some("bar")
        );
        assert_eq!(
            annotations
                .get(MANAGED_ANNOTATIONS_ANNOTATION)
                .map(String::as_str),
            Some("app.example/mine")
        );
        // CR-side system annotations are not copied onto the object.
        assert!(!annotations.contains_key("kubectl.kubernetes.io/last-applied-configuration"));
    }

    #[test]
    fn test_engine_annotations_preserved_across_sync() {
        let cr = cr_with_metadata(&[], &[]);
        let existing = map(&[
            (SECRET_VERSION_ANNOTATION, "abc123"),
            (MANAGED_LABELS_ANNOTATION, "old"),
        ]);
        let (_, annotations) = sync_labels_and_annotations(&cr, &BTreeMap::new(), &existing);
        assert_eq!(
            annotations.get(SECRET_VERSION_ANNOTATION).map(String::as_str),
            Some("abc123")
        );
        // Tracking annotations are refreshed to the current (empty) key sets.
        assert_eq!(
            annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn test_is_owned_by_matches_uid_and_kind() {
        let owner = OwnerReference {
            api_version: "secrets.infisical.com/v1alpha1".to_string(),
            kind: "InfisicalSecret".to_string(),
            name: "example".to_string(),
            uid: "uid-1".to_string(),
            controller: Some(true),
            ..Default::default()
        };
        assert!(is_owned_by(std::slice::from_ref(&owner), "uid-1", "InfisicalSecret"));
        assert!(!is_owned_by(std::slice::from_ref(&owner), "uid-2", "InfisicalSecret"));

        let foreign = OwnerReference {
            kind: "Deployment".to_string(),
            uid: "uid-1".to_string(),
            ..owner
        };
        assert!(!is_owned_by(&[foreign], "uid-1", "InfisicalSecret"));
    }

    #[test]
    fn test_convert_to_string_map() {
        let mut rendered = BTreeMap::new();
        rendered.insert("FOO".to_string(), b"1".to_vec());
        let converted = convert_to_string_map(&rendered);
        assert_eq!(converted.get("FOO").map(String::as_str), Some("1"));
    }
}
