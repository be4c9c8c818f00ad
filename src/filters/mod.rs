//! Filter kinds and the filter contract.
//!
//! A filter is a reusable request-processing unit with a declared, closed
//! set of result strings. Kind metadata (default spec, results, constructor)
//! lives in a [`FilterKind`] record registered with the
//! [`FilterRegistry`](crate::registry::FilterRegistry).

pub mod basic_auth;
pub mod header_to_json;
pub mod mock;
pub mod proxy;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;

/// Result string of a successful filter activation.
pub const RESULT_OK: &str = "";

/// A filter instance bound to one pipeline generation.
///
/// `handle` must return a value from the kind's declared result set; the
/// pipeline treats anything else as a programming error. Filters doing I/O
/// must honour the context deadline.
#[async_trait]
pub trait Filter: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn handle(&self, ctx: &mut Context) -> String;

    fn status(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Release long-lived resources. Must be idempotent.
    fn close(&self) {}
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("kind", &self.kind()).finish()
    }
}

/// Construction-time view of a filter's spec.
#[derive(Clone)]
pub struct FilterSpec {
    pub kind: String,
    pub name: String,
    raw: serde_yaml::Value,
    resilience: Arc<HashMap<String, ResiliencePolicy>>,
}

impl FilterSpec {
    pub fn new(
        kind: String,
        name: String,
        raw: serde_yaml::Value,
        resilience: Arc<HashMap<String, ResiliencePolicy>>,
    ) -> Self {
        Self {
            kind,
            name,
            raw,
            resilience,
        }
    }

    /// Deserialize the body into the kind-specific spec type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(self.raw.clone())
            .map_err(|e| Error::spec(format!("filter {} {}: {}", self.kind, self.name, e)))
    }

    /// Resilience policy by name, resolved from the owning pipeline spec.
    pub fn resilience_policy(&self, name: &str) -> Option<&ResiliencePolicy> {
        self.resilience.get(name)
    }
}

/// Static metadata of a filter kind.
#[derive(Debug)]
pub struct FilterKind {
    pub name: &'static str,
    pub description: &'static str,
    /// Declared results, excluding the empty success result.
    pub results: &'static [&'static str],
    pub default_spec: fn() -> serde_yaml::Value,
    /// Build an instance; `previous` is the prior generation on inherit and
    /// must be closed unless its resources are explicitly taken over.
    pub create: fn(FilterSpec, Option<Arc<dyn Filter>>) -> Result<Arc<dyn Filter>>,
}

impl FilterKind {
    pub fn declares(&self, result: &str) -> bool {
        result.is_empty() || self.results.contains(&result)
    }
}
