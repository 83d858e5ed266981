//! # Operator Configuration
//!
//! Cluster-wide configuration parsed from the `infisical-config` ConfigMap
//! plus the spec-level knobs every CR kind shares (host override, resync
//! interval). Per-CR values win over the global config, which wins over the
//! built-in default host.

use crate::constants::DEFAULT_API_HOST;
use crate::crd::{CaReference, TlsConfig};
use crate::error::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Cluster-wide operator configuration.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub host_api: Option<String>,
    pub tls: Option<TlsConfig>,
}

impl GlobalConfig {
    /// Parse the operator ConfigMap data. The `tls.caRef.*` triple must be
    /// all-set or all-unset.
    pub fn parse(raw: &BTreeMap<String, String>) -> Result<Self> {
        let host_api = raw.get("hostAPI").cloned().filter(|h| !h.is_empty());

        let secret_name = raw.get("tls.caRef.secretName").cloned().unwrap_or_default();
        let secret_namespace = raw
            .get("tls.caRef.secretNamespace")
            .cloned()
            .unwrap_or_default();
        let secret_key = raw.get("tls.caRef.key").cloned().unwrap_or_default();

        let tls = if secret_name.is_empty() && secret_namespace.is_empty() && secret_key.is_empty()
        {
            None
        } else if secret_name.is_empty() || secret_namespace.is_empty() || secret_key.is_empty() {
            return Err(Error::Config(
                "when tls.caRef is configured, all fields must be set (secretName, secretNamespace, key)"
                    .to_string(),
            ));
        } else {
            Some(TlsConfig {
                ca_ref: CaReference {
                    secret_name,
                    secret_namespace,
                    secret_key,
                },
            })
        };

        Ok(Self { host_api, tls })
    }

    /// Resolve the API host for a CR: CR override, then global config, then
    /// the built-in default.
    pub fn resolve_host(&self, cr_host: Option<&str>) -> String {
        match cr_host.filter(|h| !h.is_empty()) {
            Some(host) => append_api_endpoint(host),
            None => self
                .host_api
                .clone()
                .unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
        }
    }
}

/// Normalize a user-supplied host so it ends in `/api`.
pub fn append_api_endpoint(address: &str) -> String {
    if address.ends_with("/api") {
        return address.to_string();
    }
    if address.ends_with('/') {
        return format!("{address}api");
    }
    format!("{address}/api")
}

static INTERVAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<number>\d+)(?P<unit>[smhdw])$").expect("interval regex is valid")
});

/// Parse a resync interval of the form `<N><unit>` where unit is one of
/// s/m/h/d/w. Seconds require N >= 5. Empty or missing means no periodic
/// resync and returns `None`.
pub fn parse_resync_interval(interval: Option<&str>) -> Result<Option<Duration>> {
    let interval = match interval.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(v) => v,
    };

    let captures = INTERVAL_REGEX.captures(interval).ok_or_else(|| {
        Error::Config(format!(
            "invalid resync interval '{interval}'. Expected format: <number><unit> (e.g. '30s', '5m', '1h')"
        ))
    })?;

    let number: u64 = captures["number"].parse().map_err(|e| {
        Error::Config(format!("invalid resync interval number in '{interval}': {e}"))
    })?;

    let seconds = match &captures["unit"] {
        "s" => {
            if number < 5 {
                return Err(Error::Config(
                    "resync interval must be at least 5 seconds".to_string(),
                ));
            }
            number
        }
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86_400,
        "w" => number * 7 * 86_400,
        unit => {
            return Err(Error::Config(format!(
                "invalid resync interval unit '{unit}' in '{interval}'"
            )));
        }
    };

    Ok(Some(Duration::from_secs(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_global_config_host_only() {
        let config = GlobalConfig::parse(&raw(&[("hostAPI", "https://infisical.corp/api")])).unwrap();
        assert_eq!(config.host_api.as_deref(), Some("https://infisical.corp/api"));
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_parse_global_config_full_ca_triple() {
        let config = GlobalConfig::parse(&raw(&[
            ("tls.caRef.secretName", "ca"),
            ("tls.caRef.secretNamespace", "infisical-system"),
            ("tls.caRef.key", "ca.crt"),
        ]))
        .unwrap();
        let tls = config.tls.unwrap();
        assert_eq!(tls.ca_ref.secret_name, "ca");
        assert_eq!(tls.ca_ref.secret_namespace, "infisical-system");
        assert_eq!(tls.ca_ref.secret_key, "ca.crt");
    }

    #[test]
    fn test_parse_global_config_partial_ca_triple_is_error() {
        let result = GlobalConfig::parse(&raw(&[("tls.caRef.secretName", "ca")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_resolve_host_precedence() {
        let global = GlobalConfig {
            host_api: Some("https://global.example/api".to_string()),
            tls: None,
        };
        assert_eq!(
            global.resolve_host(Some("https://cr.example")),
            "https://cr.example/api"
        );
        assert_eq!(global.resolve_host(None), "https://global.example/api");
        assert_eq!(global.resolve_host(Some("")), "https://global.example/api");
        assert_eq!(GlobalConfig::default().resolve_host(None), DEFAULT_API_HOST);
    }

    #[test]
    fn test_append_api_endpoint() {
        assert_eq!(append_api_endpoint("https://x.y/api"), "https://x.y/api");
        assert_eq!(append_api_endpoint("https://x.y/"), "https://x.y/api");
        assert_eq!(append_api_endpoint("https://x.y"), "https://x.y/api");
    }

    #[test]
    fn test_parse_resync_interval_units() {
        assert_eq!(
            parse_resync_interval(Some("30s")).unwrap(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_resync_interval(Some("5m")).unwrap(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            parse_resync_interval(Some("2h")).unwrap(),
            Some(Duration::from_secs(7200))
        );
        assert_eq!(
            parse_resync_interval(Some("1d")).unwrap(),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(
            parse_resync_interval(Some("1w")).unwrap(),
            Some(Duration::from_secs(604_800))
        );
    }

    #[test]
    fn test_parse_resync_interval_empty_means_none() {
        assert_eq!(parse_resync_interval(None).unwrap(), None);
        assert_eq!(parse_resync_interval(Some("")).unwrap(), None);
    }

    #[test]
    fn test_parse_resync_interval_seconds_minimum() {
        assert!(parse_resync_interval(Some("4s")).is_err());
        assert!(parse_resync_interval(Some("5s")).is_ok());
    }

    #[test]
    fn test_parse_resync_interval_rejects_garbage() {
        assert!(parse_resync_interval(Some("abc")).is_err());
        assert!(parse_resync_interval(Some("10x")).is_err());
        assert!(parse_resync_interval(Some("m5")).is_err());
    }
}
