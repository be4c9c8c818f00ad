//! Filter kind registry and the pipeline map gates route through.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::filters::{self, Filter, FilterKind, FilterSpec};
use crate::pipeline::Pipeline;
use crate::resilience::ResiliencePolicy;

/// Process-wide table of filter kinds. Read-mostly; writes happen only at
/// registration time.
pub struct FilterRegistry {
    kinds: RwLock<HashMap<&'static str, &'static FilterKind>>,
}

static GLOBAL: OnceLock<FilterRegistry> = OnceLock::new();

impl FilterRegistry {
    /// An empty registry. Mostly useful in tests.
    pub fn empty() -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
        }
    }

    /// A registry pre-populated with the built-in filter kinds.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        registry.register(&filters::proxy::KIND);
        registry.register(&filters::mock::KIND);
        registry.register(&filters::header_to_json::KIND);
        registry.register(&filters::basic_auth::KIND);
        registry
    }

    /// The shared process-wide registry.
    pub fn global() -> &'static FilterRegistry {
        GLOBAL.get_or_init(FilterRegistry::with_builtins)
    }

    pub fn register(&self, kind: &'static FilterKind) {
        let mut kinds = self.kinds.write().expect("registry lock poisoned");
        kinds.insert(kind.name, kind);
    }

    pub fn get(&self, name: &str) -> Option<&'static FilterKind> {
        let kinds = self.kinds.read().expect("registry lock poisoned");
        kinds.get(name).copied()
    }

    pub fn kind_names(&self) -> Vec<&'static str> {
        let kinds = self.kinds.read().expect("registry lock poisoned");
        let mut names: Vec<_> = kinds.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Build a filter instance from a raw spec document.
    ///
    /// `previous` is the same-named instance of the prior pipeline generation,
    /// when one exists.
    pub fn create_filter(
        &self,
        doc: &serde_yaml::Value,
        resilience: Arc<HashMap<String, ResiliencePolicy>>,
        previous: Option<Arc<dyn Filter>>,
    ) -> Result<(String, &'static FilterKind, Arc<dyn Filter>)> {
        let kind_name = doc
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::spec("filter spec is missing `kind`"))?;
        let name = doc
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::spec(format!("filter {}: missing `name`", kind_name)))?
            .to_string();
        let kind = self
            .get(kind_name)
            .ok_or_else(|| Error::spec(format!("unknown filter kind {:?}", kind_name)))?;
        let spec = FilterSpec::new(kind_name.to_string(), name.clone(), doc.clone(), resilience);
        let filter = (kind.create)(spec, previous)?;
        Ok((name, kind, filter))
    }
}

/// Named pipelines shared between gates; the routing mux resolves a rule's
/// `backend` through this map.
#[derive(Clone, Default)]
pub struct PipelineMap {
    inner: Arc<RwLock<HashMap<String, Arc<Pipeline>>>>,
}

impl PipelineMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.inner
            .read()
            .expect("pipeline map lock poisoned")
            .get(name)
            .cloned()
    }

    /// Install a pipeline, returning the replaced generation if any.
    pub fn set(&self, name: impl Into<String>, pipeline: Arc<Pipeline>) -> Option<Arc<Pipeline>> {
        self.inner
            .write()
            .expect("pipeline map lock poisoned")
            .insert(name.into(), pipeline)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.inner
            .write()
            .expect("pipeline map lock poisoned")
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .inner
            .read()
            .expect("pipeline map lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
