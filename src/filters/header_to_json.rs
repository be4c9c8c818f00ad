//! HeaderToJSON filter: merge configured request headers into the JSON body.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Filter, FilterKind, FilterSpec};
use crate::context::Context;
use crate::error::{Error, Result};

const RESULT_JSON_ENCODE_DECODE_ERR: &str = "jsonEncodeDecodeErr";
const RESULT_BODY_READ_ERR: &str = "bodyReadErr";

/// Kind record of the HeaderToJSON filter.
pub static KIND: FilterKind = FilterKind {
    name: "HeaderToJSON",
    description: "HeaderToJSON converts selected request headers to json body fields",
    results: &[RESULT_JSON_ENCODE_DECODE_ERR, RESULT_BODY_READ_ERR],
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
    let spec: HeaderToJsonSpec = spec.decode()?;
    for entry in &spec.header_map {
        entry.validate()?;
    }
    Ok(Arc::new(HeaderToJson {
        header_map: spec.header_map,
    }))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct HeaderToJsonSpec {
    kind: String,
    name: String,

    header_map: Vec<HeaderMapEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct HeaderMapEntry {
    /// Header to read.
    header: String,

    /// JSON field to write.
    json: String,

    /// Target type: `string` (default), `int`, `float`, `bool` or `null`.
    #[serde(default = "default_type")]
    r#type: String,
}

fn default_type() -> String {
    "string".to_string()
}

impl HeaderMapEntry {
    fn validate(&self) -> Result<()> {
        match self.r#type.as_str() {
            "string" | "int" | "float" | "bool" | "null" => Ok(()),
            other => Err(Error::spec(format!(
                "headerMap entry {:?}: unknown type {:?}",
                self.header, other
            ))),
        }
    }

    fn convert(&self, value: &str) -> Option<Value> {
        match self.r#type.as_str() {
            "int" => value.parse::<f64>().ok().map(|f| {
                serde_json::Number::from_f64(f.trunc())
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }),
            "float" => value
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
            "bool" => value.parse::<bool>().ok().map(Value::Bool),
            "null" => Some(Value::Null),
            _ => Some(Value::String(value.to_string())),
        }
    }
}

struct HeaderToJson {
    header_map: Vec<HeaderMapEntry>,
}

impl HeaderToJson {
    fn collect_fields(&self, ctx: &Context) -> Option<Vec<(String, Value)>> {
        let mut fields = Vec::new();
        for entry in &self.header_map {
            let Some(raw) = ctx.request().header(&entry.header) else {
                continue;
            };
            if raw.is_empty() {
                continue;
            }
            match entry.convert(raw) {
                Some(value) => fields.push((entry.json.clone(), value)),
                None => return None,
            }
        }
        Some(fields)
    }

    fn handle_inner(&self, ctx: &mut Context) -> String {
        let Some(fields) = self.collect_fields(ctx) else {
            return RESULT_JSON_ENCODE_DECODE_ERR.to_string();
        };
        if fields.is_empty() {
            return String::new();
        }

        let body = ctx.request().body().clone();
        let merged = if body.is_empty() {
            let mut map = serde_json::Map::new();
            for (k, v) in fields {
                map.insert(k, v);
            }
            Value::Object(map)
        } else {
            match serde_json::from_slice::<Value>(&body) {
                Ok(Value::Object(mut map)) => {
                    for (k, v) in fields {
                        map.insert(k, v);
                    }
                    Value::Object(map)
                }
                Ok(Value::Array(items)) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let Value::Object(mut map) = item else {
                            return RESULT_JSON_ENCODE_DECODE_ERR.to_string();
                        };
                        for (k, v) in &fields {
                            map.insert(k.clone(), v.clone());
                        }
                        out.push(Value::Object(map));
                    }
                    Value::Array(out)
                }
                _ => return RESULT_JSON_ENCODE_DECODE_ERR.to_string(),
            }
        };

        match serde_json::to_vec(&merged) {
            Ok(bytes) => {
                ctx.request_mut().set_body(Bytes::from(bytes));
                String::new()
            }
            Err(_) => RESULT_JSON_ENCODE_DECODE_ERR.to_string(),
        }
    }
}

#[async_trait]
impl Filter for HeaderToJson {
    fn kind(&self) -> &'static str {
        KIND.name
    }

    async fn handle(&self, ctx: &mut Context) -> String {
        let result = self.handle_inner(ctx);
        ctx.call_next_handler(result).await
    }
}
