//! Mock filter: answer matched requests with canned responses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use super::{Filter, FilterKind, FilterSpec};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::spec::parse_duration;

const RESULT_MOCKED: &str = "mocked";

/// Kind record of the Mock filter.
pub static KIND: FilterKind = FilterKind {
    name: "Mock",
    description: "Mock mocks the response of matched requests",
    results: &[RESULT_MOCKED],
    default_spec: || serde_yaml::Value::Null,
    create,
};

fn create(
    spec: FilterSpec,
    previous: Option<Arc<dyn Filter>>,
) -> Result<Arc<dyn Filter>> {
    if let Some(prev) = previous {
        prev.close();
    }
    let spec: MockSpec = spec.decode()?;
    let rules = spec
        .rules
        .iter()
        .map(CompiledMockRule::compile)
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Mock { rules }))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct MockSpec {
    kind: String,
    name: String,

    rules: Vec<MockRuleSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct MockRuleSpec {
    /// Absent match means the rule matches every request.
    #[serde(default)]
    r#match: Option<MockMatchSpec>,

    code: u16,

    #[serde(default)]
    body: String,

    #[serde(default)]
    headers: BTreeMap<String, String>,

    #[serde(default)]
    delay: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct MockMatchSpec {
    #[serde(default)]
    path: Option<String>,

    #[serde(default)]
    path_prefix: Option<String>,

    /// When true every header matcher must match; otherwise one suffices.
    #[serde(default)]
    match_all_header: bool,

    #[serde(default)]
    headers: BTreeMap<String, HeaderValueMatch>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct HeaderValueMatch {
    #[serde(default)]
    exact: Option<String>,

    #[serde(default)]
    regexp: Option<String>,

    /// Matches when the header is absent or empty.
    #[serde(default)]
    empty: bool,
}

struct CompiledMockRule {
    path: Option<String>,
    path_prefix: Option<String>,
    match_all_header: bool,
    headers: Vec<(String, CompiledHeaderMatch)>,
    code: StatusCode,
    body: Bytes,
    headers_out: Vec<(HeaderName, HeaderValue)>,
    delay: Option<Duration>,
}

struct CompiledHeaderMatch {
    exact: Option<String>,
    regexp: Option<regex::Regex>,
    empty: bool,
}

impl CompiledMockRule {
    fn compile(rule: &MockRuleSpec) -> Result<Self> {
        let code = StatusCode::from_u16(rule.code)
            .map_err(|_| Error::spec(format!("mock rule has invalid code {}", rule.code)))?;

        let mut headers_out = Vec::new();
        for (k, v) in &rule.headers {
            let name: HeaderName = k
                .parse()
                .map_err(|_| Error::spec(format!("invalid mock header name {:?}", k)))?;
            let value = HeaderValue::from_str(v)
                .map_err(|_| Error::spec(format!("invalid mock header value {:?}", v)))?;
            headers_out.push((name, value));
        }

        let delay = rule.delay.as_deref().map(parse_duration).transpose()?;

        let (path, path_prefix, match_all_header, headers) = match &rule.r#match {
            None => (None, None, false, Vec::new()),
            Some(m) => {
                let mut headers = Vec::new();
                for (k, hm) in &m.headers {
                    let regexp = hm
                        .regexp
                        .as_deref()
                        .map(|re| {
                            regex::Regex::new(re).map_err(|e| {
                                Error::spec(format!("invalid header regexp {:?}: {}", re, e))
                            })
                        })
                        .transpose()?;
                    headers.push((
                        k.clone(),
                        CompiledHeaderMatch {
                            exact: hm.exact.clone(),
                            regexp,
                            empty: hm.empty,
                        },
                    ));
                }
                (
                    m.path.clone(),
                    m.path_prefix.clone(),
                    m.match_all_header,
                    headers,
                )
            }
        };

        Ok(Self {
            path,
            path_prefix,
            match_all_header,
            headers,
            code,
            body: Bytes::from(rule.body.clone()),
            headers_out,
            delay,
        })
    }

    fn matches(&self, ctx: &Context) -> bool {
        let path = ctx.request().path();
        if let Some(p) = &self.path {
            if p != path {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if self.headers.is_empty() {
            return true;
        }
        let mut matched_any = false;
        for (name, m) in &self.headers {
            let value = ctx.request().header(name).unwrap_or("");
            let hit = if m.empty {
                value.is_empty()
            } else if let Some(exact) = &m.exact {
                value == exact
            } else if let Some(re) = &m.regexp {
                re.is_match(value)
            } else {
                false
            };
            if hit {
                matched_any = true;
            } else if self.match_all_header {
                return false;
            }
        }
        matched_any || self.match_all_header
    }
}

/// The Mock filter. Matched requests short-circuit the pipeline.
struct Mock {
    rules: Vec<CompiledMockRule>,
}

#[async_trait]
impl Filter for Mock {
    fn kind(&self) -> &'static str {
        KIND.name
    }

    async fn handle(&self, ctx: &mut Context) -> String {
        let rule = self.rules.iter().find(|r| r.matches(ctx));
        let Some(rule) = rule else {
            return ctx.call_next_handler(String::new()).await;
        };

        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        let resp = ctx.response_mut();
        resp.status = rule.code;
        resp.set_body(rule.body.clone());
        for (name, value) in &rule.headers_out {
            resp.set_header(name.clone(), value.clone());
        }
        RESULT_MOCKED.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Protocol, Request};
    use crate::resilience::ResiliencePolicy;
    use std::collections::HashMap;

    fn build(yaml: &str) -> Arc<dyn Filter> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let spec = FilterSpec::new(
            "Mock".to_string(),
            "mock".to_string(),
            doc,
            Arc::new(HashMap::<String, ResiliencePolicy>::new()),
        );
        create(spec, None).unwrap()
    }

    fn ctx_for(path: &str) -> Context {
        Context::new(
            Protocol::Http,
            Request::new(hyper::Method::GET, path.parse().unwrap()),
        )
    }

    const SPEC: &str = r#"
kind: Mock
name: mock
rules:
  - match:
      pathPrefix: /login/
    code: 202
    body: 'mocked body'
    headers:
      X-Test: test1
  - match:
      path: /pets
      headers:
        X-Mock:
          exact: mock
    code: 205
    body: 'mocked body'
"#;

    #[tokio::test]
    async fn test_path_prefix_mock() {
        let mock = build(SPEC);
        let mut ctx = ctx_for("/login/1");
        let result = mock.handle(&mut ctx).await;
        assert_eq!(result, "mocked");
        assert_eq!(ctx.response().status, StatusCode::ACCEPTED);
        assert_eq!(&ctx.response().body()[..], b"mocked body");
        assert_eq!(ctx.response().header("X-Test"), Some("test1"));
    }

    #[tokio::test]
    async fn test_no_match_passes_through() {
        let mock = build(SPEC);
        let mut ctx = ctx_for("/other");
        let result = mock.handle(&mut ctx).await;
        assert_eq!(result, "");
        assert_eq!(ctx.response().status, StatusCode::OK);
        assert!(ctx.response().body().is_empty());
    }

    #[tokio::test]
    async fn test_header_match_required() {
        let mock = build(SPEC);

        let mut ctx = ctx_for("/pets");
        assert_eq!(mock.handle(&mut ctx).await, "");

        let mut ctx = ctx_for("/pets");
        ctx.request_mut().set_header(
            HeaderName::from_static("x-mock"),
            HeaderValue::from_static("mock"),
        );
        assert_eq!(mock.handle(&mut ctx).await, "mocked");
        assert_eq!(ctx.response().status.as_u16(), 205);
    }

    #[test]
    fn test_invalid_code_rejected() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "kind: Mock\nname: m\nrules:\n  - code: 1\n    body: x\n",
        )
        .unwrap();
        let spec = FilterSpec::new(
            "Mock".to_string(),
            "m".to_string(),
            doc,
            Arc::new(HashMap::<String, ResiliencePolicy>::new()),
        );
        assert!(create(spec, None).is_err());
    }
}
