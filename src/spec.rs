//! Declarative specification objects.
//!
//! Every runtime object (gate, pipeline, filter) is built from a YAML
//! document carrying `kind` and `name` plus a kind-specific body. Specs are
//! immutable once realised; reconfiguration hands a new spec to the object's
//! `reload`/`inherit` path.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ipfilter::IpFilterSpec;

/// Kind of the HTTP traffic gate.
pub const KIND_HTTP_SERVER: &str = "HTTPServer";
/// Kind of the TCP traffic gate.
pub const KIND_TCP_SERVER: &str = "TCPServer";
/// Kind of the UDP traffic gate.
pub const KIND_UDP_SERVER: &str = "UDPServer";
/// Kind of the MQTT broker gate.
pub const KIND_MQTT_PROXY: &str = "MQTTProxy";
/// Kind of a filter pipeline.
pub const KIND_PIPELINE: &str = "Pipeline";

/// A raw spec document: envelope plus the full YAML body.
#[derive(Debug, Clone)]
pub struct RawObject {
    pub kind: String,
    pub name: String,
    pub doc: serde_yaml::Value,
}

impl RawObject {
    /// Deserialize the body into a concrete spec type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_yaml::from_value(self.doc.clone())
            .map_err(|e| Error::spec(format!("{} {}: {}", self.kind, self.name, e)))
    }
}

/// Parse a multi-document YAML string into raw spec objects.
///
/// Documents without `kind` or `name` are rejected; empty documents are
/// skipped.
pub fn load_objects(input: &str) -> Result<Vec<RawObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(input) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::spec("document is missing `kind`"))?
            .to_string();
        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::spec(format!("{}: document is missing `name`", kind)))?
            .to_string();
        objects.push(RawObject {
            kind,
            name,
            doc: value,
        });
    }
    Ok(objects)
}

/// Parse a duration string such as `500ms`, `30s`, `2m` or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::spec(format!("duration {:?} is missing a unit", s)))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|_| Error::spec(format!("invalid duration {:?}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(Error::spec(format!("unknown duration unit {:?}", unit))),
    }
}

// ---------------------------------------------------------------------------
// Shared upstream definitions
// ---------------------------------------------------------------------------

/// One upstream server inside a pool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServerSpec {
    /// Upstream URL, e.g. `http://10.0.0.1:9095`. For L4 pools the scheme is
    /// ignored and only host:port is used.
    pub url: String,

    /// Weight for the `weighted` policy. All weights must be >0 or all 0.
    #[serde(default)]
    pub weight: u32,

    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Load-balance policy selection.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoadBalanceSpec {
    /// One of `roundRobin`, `random`, `weighted`, `ipHash`, `headerHash`.
    pub policy: String,

    /// Header name for the `headerHash` policy.
    #[serde(default)]
    pub header_hash_key: Option<String>,
}

impl Default for LoadBalanceSpec {
    fn default() -> Self {
        Self {
            policy: "roundRobin".to_string(),
            header_hash_key: None,
        }
    }
}

impl LoadBalanceSpec {
    pub fn validate(&self) -> Result<()> {
        match self.policy.as_str() {
            "roundRobin" | "random" | "weighted" | "ipHash" => Ok(()),
            "headerHash" => {
                if self.header_hash_key.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::spec("headerHash policy requires headerHashKey"));
                }
                Ok(())
            }
            other => Err(Error::spec(format!("unknown load balance policy {:?}", other))),
        }
    }
}

/// Health probe configuration for a pool.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Probe interval, e.g. `10s`.
    #[serde(default = "default_health_interval")]
    pub interval: String,

    /// Per-probe timeout.
    #[serde(default = "default_health_timeout")]
    pub timeout: String,

    /// Optional HTTP path to probe; a plain TCP connect is used when absent.
    #[serde(default)]
    pub path: Option<String>,

    /// Consecutive failures before a server is marked unhealthy.
    #[serde(default = "default_one")]
    pub fails: u32,

    /// Consecutive successes before a server is marked healthy again.
    #[serde(default = "default_one")]
    pub passes: u32,
}

fn default_health_interval() -> String {
    "10s".to_string()
}

fn default_health_timeout() -> String {
    "3s".to_string()
}

fn default_one() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// HTTP traffic gate
// ---------------------------------------------------------------------------

/// Spec of the HTTP traffic gate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HttpServerSpec {
    pub kind: String,
    pub name: String,

    pub port: u16,

    #[serde(default)]
    pub https: bool,

    #[serde(default)]
    pub http3: bool,

    #[serde(default = "default_true")]
    pub keep_alive: bool,

    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub cert_base64: Option<String>,

    #[serde(default)]
    pub key_base64: Option<String>,

    #[serde(default)]
    pub x_forwarded_for: bool,

    #[serde(default)]
    pub ip_filter: Option<IpFilterSpec>,

    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_timeout() -> String {
    "60s".to_string()
}

fn default_max_connections() -> usize {
    10240
}

impl HttpServerSpec {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::spec("HTTPServer port must be non-zero"));
        }
        if self.http3 {
            return Err(Error::spec(
                "http3 is not supported by this build; set http3: false",
            ));
        }
        if self.https && (self.cert_base64.is_none() || self.key_base64.is_none()) {
            return Err(Error::spec(
                "https requires both certBase64 and keyBase64",
            ));
        }
        parse_duration(&self.keep_alive_timeout)?;
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }

    /// True when the change from `self` to `next` forces a listener restart.
    ///
    /// Rules, connection caps and IP filters apply in place; everything else
    /// (port, TLS material, protocol options) tears the listener down.
    pub fn needs_restart(&self, next: &HttpServerSpec) -> bool {
        let mut a = self.clone();
        let mut b = next.clone();
        a.max_connections = 0;
        b.max_connections = 0;
        a.ip_filter = None;
        b.ip_filter = None;
        a.x_forwarded_for = false;
        b.x_forwarded_for = false;
        a.rules.clear();
        b.rules.clear();
        a != b
    }
}

/// One routing rule: an optional host plus an ordered path list.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RuleSpec {
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub ip_filter: Option<IpFilterSpec>,

    pub paths: Vec<PathSpec>,
}

impl RuleSpec {
    pub fn validate(&self) -> Result<()> {
        for path in &self.paths {
            path.validate()?;
        }
        Ok(())
    }
}

/// One path entry inside a rule, routed to a named pipeline.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PathSpec {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub path_prefix: Option<String>,

    #[serde(default)]
    pub path_regexp: Option<String>,

    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub headers: Vec<HeaderMatcherSpec>,

    /// Name of the pipeline handling matched requests.
    pub backend: String,
}

impl PathSpec {
    pub fn validate(&self) -> Result<()> {
        if self.path.is_none() && self.path_prefix.is_none() && self.path_regexp.is_none() {
            return Err(Error::spec(format!(
                "path entry for backend {:?} needs one of path, pathPrefix, pathRegexp",
                self.backend
            )));
        }
        if let Some(re) = &self.path_regexp {
            regex::Regex::new(re)
                .map_err(|e| Error::spec(format!("invalid pathRegexp {:?}: {}", re, e)))?;
        }
        for h in &self.headers {
            h.validate()?;
        }
        Ok(())
    }
}

/// Header match inside a path entry: exact values or a regexp.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct HeaderMatcherSpec {
    pub key: String,

    #[serde(default)]
    pub values: Vec<String>,

    #[serde(default)]
    pub regexp: Option<String>,
}

impl HeaderMatcherSpec {
    pub fn validate(&self) -> Result<()> {
        if self.values.is_empty() && self.regexp.is_none() {
            return Err(Error::spec(format!(
                "header matcher {:?} needs values or regexp",
                self.key
            )));
        }
        if let Some(re) = &self.regexp {
            regex::Regex::new(re)
                .map_err(|e| Error::spec(format!("invalid header regexp {:?}: {}", re, e)))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Spec of a filter pipeline.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PipelineSpec {
    pub kind: String,
    pub name: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub flow: Vec<FlowNodeSpec>,

    #[serde(default)]
    pub filters: Vec<serde_yaml::Value>,

    #[serde(default)]
    pub resilience: Vec<serde_yaml::Value>,
}

fn default_protocol() -> String {
    "http".to_string()
}

/// One entry in the pipeline flow, optionally jumping on a result.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct FlowNodeSpec {
    pub filter: String,

    /// result string -> target filter name. Only forward jumps are valid.
    #[serde(default)]
    pub jump_if: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// L4 traffic gates
// ---------------------------------------------------------------------------

/// Upstream pool shared by the L4 gates.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct L4PoolSpec {
    pub servers: Vec<ServerSpec>,

    #[serde(default)]
    pub load_balance: LoadBalanceSpec,
}

impl L4PoolSpec {
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::spec("pool needs at least one server"));
        }
        self.load_balance.validate()
    }
}

/// Spec of the TCP traffic gate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TcpServerSpec {
    pub kind: String,
    pub name: String,

    pub port: u16,

    #[serde(default = "default_l4_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    pub pool: L4PoolSpec,
}

fn default_l4_max_connections() -> usize {
    1024
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

impl TcpServerSpec {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::spec("TCPServer port must be non-zero"));
        }
        parse_duration(&self.connect_timeout)?;
        self.pool.validate()
    }
}

/// Spec of the UDP traffic gate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UdpServerSpec {
    pub kind: String,
    pub name: String,

    pub port: u16,

    /// Idle window after which a silent downstream session is closed.
    #[serde(default = "default_idle_timeout")]
    pub downstream_idle_timeout: String,

    /// Upstream read deadline and session write timeout.
    #[serde(default = "default_idle_timeout")]
    pub upstream_idle_timeout: String,

    /// When false, sessions are one-shot: packets go upstream and replies
    /// are not forwarded back.
    #[serde(default = "default_true")]
    pub duplex: bool,

    pub pool: L4PoolSpec,
}

fn default_idle_timeout() -> String {
    "60s".to_string()
}

impl UdpServerSpec {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::spec("UDPServer port must be non-zero"));
        }
        parse_duration(&self.downstream_idle_timeout)?;
        parse_duration(&self.upstream_idle_timeout)?;
        self.pool.validate()
    }
}

// ---------------------------------------------------------------------------
// MQTT broker gate
// ---------------------------------------------------------------------------

/// Spec of the MQTT broker gate.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MqttProxySpec {
    pub kind: String,
    pub name: String,

    pub port: u16,

    pub auth: Vec<MqttAuthSpec>,

    #[serde(default)]
    pub use_tls: bool,

    #[serde(default)]
    pub cert_base64: Option<String>,

    #[serde(default)]
    pub key_base64: Option<String>,
}

/// Username plus base64-encoded password.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MqttAuthSpec {
    pub user_name: String,
    pub pass_base64: String,
}

impl MqttProxySpec {
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::spec("MQTTProxy port must be non-zero"));
        }
        if self.auth.is_empty() {
            return Err(Error::spec("MQTTProxy requires at least one auth entry"));
        }
        if self.use_tls && (self.cert_base64.is_none() || self.key_base64.is_none()) {
            return Err(Error::spec("useTLS requires certBase64 and keyBase64"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_load_objects_multi_doc() {
        let yaml = r#"
kind: HTTPServer
name: edge
port: 10080
---
kind: Pipeline
name: pipeline-demo
flow:
  - filter: proxy
"#;
        let objects = load_objects(yaml).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].kind, "HTTPServer");
        assert_eq!(objects[1].name, "pipeline-demo");
    }

    #[test]
    fn test_load_objects_missing_name() {
        let err = load_objects("kind: HTTPServer\nport: 1\n").unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_http_spec_unknown_field_rejected() {
        let yaml = r#"
kind: HTTPServer
name: edge
port: 10080
bogus: true
"#;
        let obj = &load_objects(yaml).unwrap()[0];
        assert!(obj.decode::<HttpServerSpec>().is_err());
    }

    #[test]
    fn test_http_spec_defaults() {
        let yaml = "kind: HTTPServer\nname: edge\nport: 10080\n";
        let spec: HttpServerSpec = load_objects(yaml).unwrap()[0].decode().unwrap();
        assert!(spec.keep_alive);
        assert_eq!(spec.keep_alive_timeout, "60s");
        assert_eq!(spec.max_connections, 10240);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_http_spec_http3_rejected() {
        let yaml = "kind: HTTPServer\nname: edge\nport: 10080\nhttp3: true\n";
        let spec: HttpServerSpec = load_objects(yaml).unwrap()[0].decode().unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_needs_restart_rules_are_compatible() {
        let yaml = r#"
kind: HTTPServer
name: edge
port: 10080
rules:
  - paths:
      - pathPrefix: /pipeline
        backend: pipeline-demo
"#;
        let a: HttpServerSpec = load_objects(yaml).unwrap()[0].decode().unwrap();
        let mut b = a.clone();
        b.rules.clear();
        b.max_connections = 1;
        assert!(!a.needs_restart(&b));

        let mut c = a.clone();
        c.port = 10081;
        assert!(a.needs_restart(&c));
    }

    #[test]
    fn test_header_matcher_requires_values_or_regexp() {
        let m = HeaderMatcherSpec {
            key: "X-Test".to_string(),
            values: vec![],
            regexp: None,
        };
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_load_balance_validate() {
        let ok = LoadBalanceSpec {
            policy: "weighted".into(),
            header_hash_key: None,
        };
        assert!(ok.validate().is_ok());
        let bad = LoadBalanceSpec {
            policy: "magic".into(),
            header_hash_key: None,
        };
        assert!(bad.validate().is_err());
        let hh = LoadBalanceSpec {
            policy: "headerHash".into(),
            header_hash_key: None,
        };
        assert!(hh.validate().is_err());
    }
}
