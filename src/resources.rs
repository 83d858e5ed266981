//! # Per-Resource Variables
//!
//! In-process cache of per-CR state: the authenticated upstream client, the
//! cancellation root for everything the engine starts for the CR, the cached
//! authentication outcome, and the event stream registry. Exactly one entry
//! exists per CR UID between the first reconcile and CR deletion.

use crate::api::ApiClient;
use crate::crd::{Authentication, AuthenticationDetails, TlsConfig};
use crate::error::Result;
use crate::sse::ConnectionRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The auth-affecting subset of a CR spec. A structural change here
/// invalidates the cached entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInputs {
    pub host_api: Option<String>,
    pub authentication: Authentication,
    pub tls: Option<TlsConfig>,
}

/// Cached state for one CR.
pub struct ResourceVariables {
    pub api: Arc<ApiClient>,
    /// Root of every task the engine starts for this CR.
    pub cancel_root: CancellationToken,
    pub stream: Arc<ConnectionRegistry>,
    auth_inputs: AuthInputs,
    auth_details: StdMutex<Option<AuthenticationDetails>>,
}

impl ResourceVariables {
    pub fn new(
        api: Arc<ApiClient>,
        cancel_root: CancellationToken,
        stream: Arc<ConnectionRegistry>,
        auth_inputs: AuthInputs,
    ) -> Self {
        Self {
            api,
            cancel_root,
            stream,
            auth_inputs,
            auth_details: StdMutex::new(None),
        }
    }

    /// Empty until authentication has succeeded.
    pub fn auth_details(&self) -> Option<AuthenticationDetails> {
        self.auth_details.lock().expect("auth lock poisoned").clone()
    }

    pub fn set_auth_details(&self, details: AuthenticationDetails) {
        *self.auth_details.lock().expect("auth lock poisoned") = Some(details);
    }

    /// Cancel the CR's task tree and shut the stream down.
    pub async fn close(&self) {
        self.cancel_root.cancel();
        self.stream.close().await;
    }
}

/// Map of CR UID to cached state.
#[derive(Default)]
pub struct ResourceVariablesMap {
    entries: Mutex<HashMap<String, Arc<ResourceVariables>>>,
}

impl ResourceVariablesMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the entry for a CR, creating it on first access. When the
    /// auth-affecting inputs changed, the previous entry is closed first and
    /// a fresh one built; re-auth must never leak the old stream registry.
    pub async fn acquire<F>(
        &self,
        uid: &str,
        inputs: AuthInputs,
        build: F,
    ) -> Result<Arc<ResourceVariables>>
    where
        F: FnOnce(&CancellationToken) -> Result<(Arc<ApiClient>, Arc<ConnectionRegistry>)>,
    {
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(uid) {
            if existing.auth_inputs == inputs {
                return Ok(existing.clone());
            }
            let stale = entries.remove(uid).expect("entry just found");
            stale.close().await;
        }

        let cancel_root = CancellationToken::new();
        let (api, stream) = build(&cancel_root)?;
        let entry = Arc::new(ResourceVariables::new(api, cancel_root, stream, inputs));
        entries.insert(uid.to_string(), entry.clone());
        Ok(entry)
    }

    /// Look up without creating.
    pub async fn get(&self, uid: &str) -> Option<Arc<ResourceVariables>> {
        self.entries.lock().await.get(uid).cloned()
    }

    /// Evict on CR deletion: cancel, close the stream, drop the entry.
    pub async fn remove(&self, uid: &str) {
        let entry = self.entries.lock().await.remove(uid);
        if let Some(entry) = entry {
            entry.close().await;
        }
    }
}
