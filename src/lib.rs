//! # Infisical Secrets Operator
//!
//! A Kubernetes operator that synchronizes secret material between
//! [Infisical](https://infisical.com) and in-cluster objects.
//!
//! ## Overview
//!
//! Three custom resources drive the operator:
//!
//! 1. **InfisicalSecret** - Pulls Infisical secrets into managed cluster
//!    Secrets and ConfigMaps, with optional templating, tracked
//!    labels/annotations, and orphan cleanup of owned objects
//! 2. **InfisicalPushSecret** - Pushes an existing cluster Secret's entries
//!    up to Infisical
//! 3. **InfisicalDynamicSecret** - Materializes short-lived credentials from
//!    dynamic-secret leases, renewing them before expiry
//!
//! ## Instant updates
//!
//! For machine-identity resources the operator holds a server-sent-event
//! subscription against the Infisical project event stream. Upstream secret
//! changes become synthetic reconcile triggers, so managed objects converge
//! within seconds instead of waiting for the resync interval. The stream is
//! health-monitored and reconnects with exponential backoff.
//!
//! ## Features
//!
//! - **Multiple auth strategies**: machine identity (universal auth) plus
//!   legacy service tokens and service accounts
//! - **Templated outputs**: user templates over fetched secrets with helper
//!   filters
//! - **Three-way metadata sync**: CR labels/annotations are reasserted while
//!   out-of-band edits survive
//! - **Prometheus metrics** and HTTP probes

pub mod api;
pub mod config;
pub mod constants;
pub mod crd;
pub mod dynamic;
pub mod error;
pub mod managed;
pub mod observability;
pub mod push;
pub mod reconciler;
pub mod resources;
pub mod secrets;
pub mod server;
pub mod sse;
pub mod template;

pub use crd::{InfisicalDynamicSecret, InfisicalPushSecret, InfisicalSecret};
pub use error::{Error, Result};
