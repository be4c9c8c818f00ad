//! Request match expressions for candidate and mirror pools.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::error::{Error, Result};

/// Spec of a pool filter expression: header and method/URL matches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RequestMatchSpec {
    /// When true every header matcher must match; otherwise one suffices.
    #[serde(default)]
    pub match_all_headers: bool,

    #[serde(default)]
    pub headers: BTreeMap<String, ValueMatchSpec>,

    #[serde(default)]
    pub urls: Vec<MethodAndUrlMatchSpec>,
}

/// Value matcher: exact, prefix, regex, or empty.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ValueMatchSpec {
    #[serde(default)]
    pub exact: Option<String>,

    #[serde(default)]
    pub prefix: Option<String>,

    #[serde(default)]
    pub regex: Option<String>,

    #[serde(default)]
    pub empty: bool,
}

/// Method list plus a URL (path) matcher.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MethodAndUrlMatchSpec {
    /// Empty means any method.
    #[serde(default)]
    pub methods: Vec<String>,

    pub url: ValueMatchSpec,
}

struct CompiledValueMatch {
    exact: Option<String>,
    prefix: Option<String>,
    regex: Option<regex::Regex>,
    empty: bool,
}

impl CompiledValueMatch {
    fn compile(spec: &ValueMatchSpec) -> Result<Self> {
        if spec.exact.is_none() && spec.prefix.is_none() && spec.regex.is_none() && !spec.empty {
            return Err(Error::spec(
                "value matcher needs one of exact, prefix, regex, empty",
            ));
        }
        let regex = spec
            .regex
            .as_deref()
            .map(|re| {
                regex::Regex::new(re)
                    .map_err(|e| Error::spec(format!("invalid regex {:?}: {}", re, e)))
            })
            .transpose()?;
        Ok(Self {
            exact: spec.exact.clone(),
            prefix: spec.prefix.clone(),
            regex,
            empty: spec.empty,
        })
    }

    fn matches(&self, value: &str) -> bool {
        if self.empty && value.is_empty() {
            return true;
        }
        if let Some(exact) = &self.exact {
            if value == exact {
                return true;
            }
        }
        if let Some(prefix) = &self.prefix {
            if value.starts_with(prefix.as_str()) {
                return true;
            }
        }
        if let Some(re) = &self.regex {
            if re.is_match(value) {
                return true;
            }
        }
        false
    }
}

struct CompiledUrlMatch {
    methods: Vec<String>,
    url: CompiledValueMatch,
}

/// A compiled pool filter expression.
pub struct RequestMatcher {
    match_all_headers: bool,
    headers: Vec<(String, CompiledValueMatch)>,
    urls: Vec<CompiledUrlMatch>,
}

impl RequestMatcher {
    pub fn compile(spec: &RequestMatchSpec) -> Result<Self> {
        let headers = spec
            .headers
            .iter()
            .map(|(k, v)| Ok((k.clone(), CompiledValueMatch::compile(v)?)))
            .collect::<Result<Vec<_>>>()?;
        let urls = spec
            .urls
            .iter()
            .map(|u| {
                Ok(CompiledUrlMatch {
                    methods: u.methods.iter().map(|m| m.to_uppercase()).collect(),
                    url: CompiledValueMatch::compile(&u.url)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if headers.is_empty() && urls.is_empty() {
            return Err(Error::spec("pool filter matches nothing"));
        }
        Ok(Self {
            match_all_headers: spec.match_all_headers,
            headers,
            urls,
        })
    }

    pub fn matches(&self, ctx: &Context) -> bool {
        if !self.headers.is_empty() {
            let mut any = false;
            for (name, matcher) in &self.headers {
                let value = ctx.request().header(name).unwrap_or("");
                if matcher.matches(value) {
                    any = true;
                } else if self.match_all_headers {
                    return false;
                }
            }
            if !any {
                return false;
            }
        }

        if self.urls.is_empty() {
            return true;
        }
        let method = ctx.request().method.as_str();
        let path = ctx.request().path();
        self.urls.iter().any(|u| {
            (u.methods.is_empty() || u.methods.iter().any(|m| m == method))
                && u.url.matches(path)
        })
    }
}
