//! # Template Renderer
//!
//! Renders user templates from a managed descriptor over the fetched
//! secrets. Every fetched secret is bound as `KEY` with `value` and
//! `secret_path` attributes, so `{{ DB_HOST.value }}` interpolates the
//! secret value. Missing keys render empty; hard template errors fail the
//! reconcile carrying the offending output key.

use crate::api::SecretVariable;
use crate::crd::SecretTemplate;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct TemplateBinding<'a> {
    value: &'a str,
    secret_path: &'a str,
}

fn b64enc(value: String) -> String {
    BASE64.encode(value.as_bytes())
}

fn b64dec(value: String) -> std::result::Result<String, minijinja::Error> {
    let decoded = BASE64.decode(value.as_bytes()).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("invalid base64 input: {e}"),
        )
    })?;
    String::from_utf8(decoded).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("decoded value is not UTF-8: {e}"),
        )
    })
}

fn to_json(value: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
    serde_json::to_string(&value).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("value is not JSON serializable: {e}"),
        )
    })
}

fn template_environment() -> Environment<'static> {
    let mut env = Environment::new();
    // Missing secret keys render as empty rather than failing the reconcile.
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_filter("b64enc", b64enc);
    env.add_filter("b64dec", b64dec);
    env.add_filter("to_json", to_json);
    env
}

/// Produce the byte payload for a managed object. Without a template the
/// output is exactly the fetched `{key -> value}` map; with one, templated
/// entries are rendered and, when `include_all_secrets` is set, unioned over
/// the literal map.
pub fn render_managed_data(
    template: Option<&SecretTemplate>,
    secrets: &[SecretVariable],
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut rendered = BTreeMap::new();

    let include_all = template.is_none_or(|t| t.include_all_secrets);
    if include_all {
        for secret in secrets {
            rendered.insert(secret.key.clone(), secret.value.clone().into_bytes());
        }
    }

    let Some(template) = template else {
        return Ok(rendered);
    };
    if template.data.is_empty() {
        return Ok(rendered);
    }

    let env = template_environment();
    let bindings: BTreeMap<&str, TemplateBinding> = secrets
        .iter()
        .map(|secret| {
            (
                secret.key.as_str(),
                TemplateBinding {
                    value: &secret.value,
                    secret_path: &secret.secret_path,
                },
            )
        })
        .collect();

    for (key, expression) in &template.data {
        let output = env
            .render_str(expression, &bindings)
            .map_err(|e| Error::Template {
                key: key.clone(),
                message: e.to_string(),
            })?;
        rendered.insert(key.clone(), output.into_bytes());
    }

    Ok(rendered)
}
