//! BasicAuth filter: validate `Authorization: Basic` credentials.
//!
//! Credentials come from an inline user list or an htpasswd-style file with
//! `user:base64password` lines, mirroring the `/credentials/{userId}` layout
//! of the durable store.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hyper::header::HeaderValue;
use hyper::StatusCode;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::{Filter, FilterKind, FilterSpec};
use crate::context::Context;
use crate::error::{Error, Result};

const RESULT_INVALID: &str = "invalid";

const USER_CACHE_SIZE: usize = 256;

/// Kind record of the BasicAuth filter.
pub static KIND: FilterKind = FilterKind {
    name: "BasicAuth",
    description: "BasicAuth rejects requests without valid basic credentials",
    results: &[RESULT_INVALID],
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
    let spec: BasicAuthSpec = spec.decode()?;
    if spec.users.is_empty() && spec.user_file.is_none() {
        return Err(Error::spec("BasicAuth needs users or userFile"));
    }
    let mut users = HashMap::new();
    for user in &spec.users {
        let password = BASE64
            .decode(&user.pass_base64)
            .map_err(|_| Error::spec(format!("user {:?}: passBase64 is not base64", user.user_name)))?;
        let password = String::from_utf8(password)
            .map_err(|_| Error::spec(format!("user {:?}: password is not utf-8", user.user_name)))?;
        users.insert(user.user_name.clone(), password);
    }
    let cache_size = NonZeroUsize::new(USER_CACHE_SIZE).expect("non-zero cache size");
    Ok(Arc::new(BasicAuth {
        users,
        user_file: spec.user_file.map(PathBuf::from),
        cache: Mutex::new(LruCache::new(cache_size)),
    }))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct BasicAuthSpec {
    kind: String,
    name: String,

    #[serde(default)]
    users: Vec<UserSpec>,

    /// File with `user:base64password` lines.
    #[serde(default)]
    user_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct UserSpec {
    user_name: String,
    pass_base64: String,
}

struct BasicAuth {
    users: HashMap<String, String>,
    user_file: Option<PathBuf>,
    cache: Mutex<LruCache<String, String>>,
}

impl BasicAuth {
    fn lookup(&self, user: &str) -> Option<String> {
        if let Some(password) = self.users.get(user) {
            return Some(password.clone());
        }
        let file = self.user_file.as_ref()?;

        if let Some(password) = self.cache.lock().expect("user cache lock poisoned").get(user) {
            return Some(password.clone());
        }

        let content = match std::fs::read_to_string(file) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "failed to read user file");
                return None;
            }
        };
        for line in content.lines() {
            let Some((name, encoded)) = line.split_once(':') else {
                continue;
            };
            if name != user {
                continue;
            }
            let password = BASE64
                .decode(encoded.trim())
                .ok()
                .and_then(|b| String::from_utf8(b).ok())?;
            self.cache
                .lock()
                .expect("user cache lock poisoned")
                .put(user.to_string(), password.clone());
            return Some(password);
        }
        None
    }

    fn authenticate(&self, ctx: &Context) -> bool {
        let Some(header) = ctx.request().header("authorization") else {
            return false;
        };
        let Some(encoded) = header.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };
        match self.lookup(user) {
            Some(expected) => expected == pass,
            None => false,
        }
    }
}

#[async_trait]
impl Filter for BasicAuth {
    fn kind(&self) -> &'static str {
        KIND.name
    }

    async fn handle(&self, ctx: &mut Context) -> String {
        if self.authenticate(ctx) {
            return ctx.call_next_handler(String::new()).await;
        }
        let resp = ctx.response_mut();
        resp.status = StatusCode::UNAUTHORIZED;
        resp.set_header(
            hyper::header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"restricted\""),
        );
        RESULT_INVALID.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Protocol, Request};
    use crate::resilience::ResiliencePolicy;
    use hyper::header::HeaderName;

    fn build(yaml: &str) -> Arc<dyn Filter> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        let spec = FilterSpec::new(
            "BasicAuth".to_string(),
            "auth".to_string(),
            doc,
            Arc::new(HashMap::<String, ResiliencePolicy>::new()),
        );
        create(spec, None).unwrap()
    }

    fn spec_with_user() -> Arc<dyn Filter> {
        // password: "secret"
        build(
            r#"
kind: BasicAuth
name: auth
users:
  - userName: alice
    passBase64: c2VjcmV0
"#,
        )
    }

    fn ctx_with_auth(value: Option<&str>) -> Context {
        let mut req = Request::new(hyper::Method::GET, "/".parse().unwrap());
        if let Some(v) = value {
            req.set_header(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        Context::new(Protocol::Http, req)
    }

    #[tokio::test]
    async fn test_valid_credentials_pass() {
        let filter = spec_with_user();
        let credentials = BASE64.encode("alice:secret");
        let mut ctx = ctx_with_auth(Some(&format!("Basic {}", credentials)));
        assert_eq!(filter.handle(&mut ctx).await, "");
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let filter = spec_with_user();
        let credentials = BASE64.encode("alice:nope");
        let mut ctx = ctx_with_auth(Some(&format!("Basic {}", credentials)));
        assert_eq!(filter.handle(&mut ctx).await, RESULT_INVALID);
        assert_eq!(ctx.response().status, StatusCode::UNAUTHORIZED);
        assert!(ctx.response().header("www-authenticate").is_some());
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let filter = spec_with_user();
        let mut ctx = ctx_with_auth(None);
        assert_eq!(filter.handle(&mut ctx).await, RESULT_INVALID);
    }

    #[tokio::test]
    async fn test_user_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users");
        std::fs::write(&path, format!("bob:{}\n", BASE64.encode("hunter2"))).unwrap();

        let filter = build(&format!(
            "kind: BasicAuth\nname: auth\nuserFile: {}\n",
            path.display()
        ));
        let credentials = BASE64.encode("bob:hunter2");
        let mut ctx = ctx_with_auth(Some(&format!("Basic {}", credentials)));
        assert_eq!(filter.handle(&mut ctx).await, "");
    }

    #[test]
    fn test_spec_requires_some_source() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("kind: BasicAuth\nname: auth\n").unwrap();
        let spec = FilterSpec::new(
            "BasicAuth".to_string(),
            "auth".to_string(),
            doc,
            Arc::new(HashMap::<String, ResiliencePolicy>::new()),
        );
        assert!(create(spec, None).is_err());
    }
}
