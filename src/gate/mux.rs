//! Request routing for the HTTP gate: IP filtering plus a rules table
//! mapping path/method/header matches to named pipelines.

use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::context::Request;
use crate::error::Result;
use crate::ipfilter::IpFilter;
use crate::spec::{HeaderMatcherSpec, HttpServerSpec};

/// Routing decision for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteResult {
    /// Name of the pipeline to run.
    Backend(String),
    NotFound,
    IpBlocked,
}

/// The gate's routing table. Reload swaps the compiled rules atomically; in
/// flight requests finish against the snapshot they started with.
pub struct Mux {
    compiled: RwLock<Arc<CompiledMux>>,
}

pub(crate) struct CompiledMux {
    ip_filter: Option<IpFilter>,
    rules: Vec<CompiledRule>,
    pub x_forwarded_for: bool,
}

struct CompiledRule {
    host: Option<String>,
    ip_filter: Option<IpFilter>,
    paths: Vec<CompiledPath>,
}

struct CompiledPath {
    path: Option<String>,
    path_prefix: Option<String>,
    path_regexp: Option<Regex>,
    methods: Vec<String>,
    headers: Vec<CompiledHeaderMatcher>,
    backend: String,
}

struct CompiledHeaderMatcher {
    key: String,
    values: Vec<String>,
    regexp: Option<Regex>,
}

impl CompiledHeaderMatcher {
    fn compile(spec: &HeaderMatcherSpec) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            key: spec.key.clone(),
            values: spec.values.clone(),
            regexp: spec
                .regexp
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| crate::error::Error::spec(e.to_string()))?,
        })
    }

    fn matches(&self, value: &str) -> bool {
        if self.values.iter().any(|v| v == value) {
            return true;
        }
        self.regexp.as_ref().is_some_and(|re| re.is_match(value))
    }
}

impl CompiledPath {
    fn matches(&self, req: &Request) -> bool {
        let path = req.path();
        let path_hit = match (&self.path, &self.path_prefix, &self.path_regexp) {
            (Some(exact), _, _) if exact == path => true,
            (_, Some(prefix), _) if path.starts_with(prefix.as_str()) => true,
            (_, _, Some(re)) if re.is_match(path) => true,
            _ => false,
        };
        if !path_hit {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == req.method.as_str()) {
            return false;
        }
        self.headers
            .iter()
            .all(|h| h.matches(req.header(&h.key).unwrap_or("")))
    }
}

impl CompiledMux {
    fn compile(spec: &HttpServerSpec) -> Result<Self> {
        let ip_filter = spec.ip_filter.as_ref().map(IpFilter::new).transpose()?;
        let mut rules = Vec::with_capacity(spec.rules.len());
        for rule in &spec.rules {
            let rule_filter = rule.ip_filter.as_ref().map(IpFilter::new).transpose()?;
            let mut paths = Vec::with_capacity(rule.paths.len());
            for path in &rule.paths {
                path.validate()?;
                paths.push(CompiledPath {
                    path: path.path.clone(),
                    path_prefix: path.path_prefix.clone(),
                    path_regexp: path
                        .path_regexp
                        .as_deref()
                        .map(Regex::new)
                        .transpose()
                        .map_err(|e| crate::error::Error::spec(e.to_string()))?,
                    methods: path.methods.iter().map(|m| m.to_uppercase()).collect(),
                    headers: path
                        .headers
                        .iter()
                        .map(CompiledHeaderMatcher::compile)
                        .collect::<Result<Vec<_>>>()?,
                    backend: path.backend.clone(),
                });
            }
            rules.push(CompiledRule {
                host: rule.host.clone(),
                ip_filter: rule_filter,
                paths,
            });
        }
        Ok(Self {
            ip_filter,
            rules,
            x_forwarded_for: spec.x_forwarded_for,
        })
    }
}

impl Mux {
    pub fn new(spec: &HttpServerSpec) -> Result<Self> {
        Ok(Self {
            compiled: RwLock::new(Arc::new(CompiledMux::compile(spec)?)),
        })
    }

    /// Swap in rules from a new spec generation.
    pub fn reload(&self, spec: &HttpServerSpec) -> Result<()> {
        let next = Arc::new(CompiledMux::compile(spec)?);
        *self.compiled.write().expect("mux lock poisoned") = next;
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Arc<CompiledMux> {
        self.compiled.read().expect("mux lock poisoned").clone()
    }

    pub fn route(&self, req: &Request) -> RouteResult {
        let compiled = self.snapshot();

        if let (Some(filter), Some(addr)) = (&compiled.ip_filter, req.client_addr) {
            if !filter.allows(addr.ip()) {
                return RouteResult::IpBlocked;
            }
        }

        let host = req.host();
        for rule in &compiled.rules {
            if let Some(expected) = &rule.host {
                // Match with and without the port part.
                let hit = host.as_deref().is_some_and(|h| {
                    h == expected || h.split(':').next() == Some(expected.as_str())
                });
                if !hit {
                    continue;
                }
            }
            if let (Some(filter), Some(addr)) = (&rule.ip_filter, req.client_addr) {
                if !filter.allows(addr.ip()) {
                    return RouteResult::IpBlocked;
                }
            }
            for path in &rule.paths {
                if path.matches(req) {
                    return RouteResult::Backend(path.backend.clone());
                }
            }
        }
        RouteResult::NotFound
    }
}
