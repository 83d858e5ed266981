//! # Managed Output Tests
//!
//! End-to-end checks of the pure pipeline from fetched secrets to the
//! metadata and payload a managed object would be written with: rendering,
//! etag computation, and the three-way label/annotation merge.

use infisical_operator::api::SecretVariable;
use infisical_operator::constants::{
    MANAGED_ANNOTATIONS_ANNOTATION, MANAGED_LABELS_ANNOTATION,
};
use infisical_operator::crd::{Authentication, InfisicalSecret, InfisicalSecretSpec, SecretTemplate};
use infisical_operator::managed::{compute_etag, sync_labels_and_annotations};
use infisical_operator::template::render_managed_data;
use std::collections::BTreeMap;

fn fetched() -> Vec<SecretVariable> {
    vec![
        SecretVariable {
            key: "FOO".to_string(),
            value: "1".to_string(),
            secret_path: "/".to_string(),
        },
        SecretVariable {
            key: "BAR".to_string(),
            value: "2".to_string(),
            secret_path: "/".to_string(),
        },
    ]
}

fn cr(labels: &[(&str, &str)]) -> InfisicalSecret {
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
    cr.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    cr
}

#[test]
fn test_initial_pull_payload_and_markers() {
    // No template: the payload is exactly the fetched map; the version etag
    // is non-empty and the managed-labels marker is empty for a label-less CR.
    let rendered = render_managed_data(None, &fetched()).unwrap();
    assert_eq!(rendered.len(), 2);
    assert_eq!(rendered["FOO"], b"1");
    assert_eq!(rendered["BAR"], b"2");

    let etag = compute_etag(&rendered);
    assert!(!etag.is_empty());

    let cr = cr(&[]);
    let (labels, annotations) =
        sync_labels_and_annotations(&cr, &BTreeMap::new(), &BTreeMap::new());
    assert!(labels.is_empty());
    assert_eq!(
        annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
        Some("")
    );
    assert_eq!(
        annotations
            .get(MANAGED_ANNOTATIONS_ANNOTATION)
            .map(String::as_str),
        Some("")
    );
}

#[test]
fn test_template_combined_output() {
    let template = SecretTemplate {
        include_all_secrets: false,
        data: [(
            "combined".to_string(),
            "{{ FOO.value }}-{{ BAR.value }}".to_string(),
        )]
        .into_iter()
        .collect(),
    };
    let rendered = render_managed_data(Some(&template), &fetched()).unwrap();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered["combined"], b"1-2");
}

#[test]
fn test_etag_tracks_rendered_output_not_fetch_order() {
    let mut reversed = fetched();
    reversed.reverse();
    let a = render_managed_data(None, &fetched()).unwrap();
    let b = render_managed_data(None, &reversed).unwrap();
    assert_eq!(compute_etag(&a), compute_etag(&b));

    let template = SecretTemplate {
        include_all_secrets: true,
        data: [("extra".to_string(), "x".to_string())].into_iter().collect(),
    };
    let c = render_managed_data(Some(&template), &fetched()).unwrap();
    assert_ne!(compute_etag(&a), compute_etag(&c));
}

#[test]
fn test_label_drift_across_three_reconciles() {
    // Reconcile 1: CR declares {team:a}.
    let (labels, annotations) =
        sync_labels_and_annotations(&cr(&[("team", "a")]), &BTreeMap::new(), &BTreeMap::new());
    assert_eq!(labels.get("team").map(String::as_str), Some("a"));

    // A human adds {owner:ops} directly on the managed object.
    let mut drifted = labels;
    drifted.insert("owner".to_string(), "ops".to_string());

    // Reconcile 2: CR declares {team:a, tier:gold}.
    let (labels, annotations) = sync_labels_and_annotations(
        &cr(&[("team", "a"), ("tier", "gold")]),
        &drifted,
        &annotations,
    );
    assert_eq!(labels.len(), 3);
    assert_eq!(labels.get("owner").map(String::as_str), Some("ops"));
    assert_eq!(
        annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
        Some("team,tier")
    );

    // Reconcile 3: CR drops tier; the operator removes it, the human label
    // survives.
    let (labels, annotations) =
        sync_labels_and_annotations(&cr(&[("team", "a")]), &labels, &annotations);
    assert!(!labels.contains_key("tier"));
    assert_eq!(labels.get("owner").map(String::as_str), Some("ops"));
    assert_eq!(
        annotations.get(MANAGED_LABELS_ANNOTATION).map(String::as_str),
        Some("team")
    );
}
