//! Proxy filter: dispatch requests to main/candidate/mirror server pools.

pub mod balance;
pub mod compression;
pub mod matcher;
pub mod pool;
pub mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use self::compression::{Compression, CompressionSpec};
use self::pool::{ServerPool, ServerPoolSpec, ServerPoolStatus};
use self::transport::{MtlsSpec, Transport};
use super::{Filter, FilterKind, FilterSpec};
use crate::context::Context;
use crate::error::{Error, Result};

pub(crate) const RESULT_FALLBACK: &str = "fallback";
pub(crate) const RESULT_INTERNAL_ERROR: &str = "internalError";
pub(crate) const RESULT_CLIENT_ERROR: &str = "clientError";
pub(crate) const RESULT_SERVER_ERROR: &str = "serverError";
pub(crate) const RESULT_FAILURE_CODE: &str = "failureCode";
pub(crate) const RESULT_TIMEOUT: &str = "timeout";
pub(crate) const RESULT_SHORT_CIRCUITED: &str = "shortCircuited";

const DEFAULT_MAX_IDLE_CONNS: usize = 10240;
const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 1024;

/// Kind record of the Proxy filter.
pub static KIND: FilterKind = FilterKind {
    name: "Proxy",
    description: "Proxy forwards requests to upstream server pools",
    results: &[
        RESULT_FALLBACK,
        RESULT_INTERNAL_ERROR,
        RESULT_CLIENT_ERROR,
        RESULT_SERVER_ERROR,
        RESULT_FAILURE_CODE,
        RESULT_TIMEOUT,
        RESULT_SHORT_CIRCUITED,
    ],
    default_spec: || {
        serde_yaml::from_str(&format!(
            "maxIdleConns: {}\nmaxIdleConnsPerHost: {}\n",
            DEFAULT_MAX_IDLE_CONNS, DEFAULT_MAX_IDLE_CONNS_PER_HOST
        ))
        .unwrap_or(serde_yaml::Value::Null)
    },
    create,
};

fn create(
    spec: FilterSpec,
    previous: Option<Arc<dyn Filter>>,
) -> Result<Arc<dyn Filter>> {
    // A fresh generation builds its own transport; the predecessor's pools
    // and probes are shut down here.
    if let Some(prev) = previous {
        prev.close();
    }
    let proxy_spec: ProxySpec = spec.decode()?;
    proxy_spec.validate()?;
    Proxy::build(&spec, proxy_spec)
}

/// Spec of the Proxy filter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ProxySpec {
    pub kind: String,
    pub name: String,

    /// Exactly one pool without a filter expression is the main pool; the
    /// rest are candidates consulted in order.
    pub pools: Vec<ServerPoolSpec>,

    #[serde(default)]
    pub mirror_pool: Option<ServerPoolSpec>,

    #[serde(default)]
    pub compression: Option<CompressionSpec>,

    #[serde(default)]
    pub mtls: Option<MtlsSpec>,

    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,

    /// Request bodies beyond this many bytes fail with `clientError`.
    /// Zero means unlimited.
    #[serde(default)]
    pub server_max_body_size: u64,
}

fn default_max_idle_conns() -> usize {
    DEFAULT_MAX_IDLE_CONNS
}

fn default_max_idle_conns_per_host() -> usize {
    DEFAULT_MAX_IDLE_CONNS_PER_HOST
}

impl ProxySpec {
    pub fn validate(&self) -> Result<()> {
        let main_pools = self.pools.iter().filter(|p| p.filter.is_none()).count();
        if main_pools != 1 {
            return Err(Error::spec("one and only one main pool is required"));
        }
        for (i, pool) in self.pools.iter().enumerate() {
            pool.validate()
                .map_err(|e| Error::spec(format!("pool {}: {}", i, e)))?;
        }
        if let Some(mirror) = &self.mirror_pool {
            if mirror.filter.is_none() {
                return Err(Error::spec("mirrorPool requires a filter expression"));
            }
            if mirror.memory_cache.is_some() {
                return Err(Error::spec("mirrorPool must not define a memoryCache"));
            }
            mirror
                .validate()
                .map_err(|e| Error::spec(format!("mirrorPool: {}", e)))?;
        }
        Ok(())
    }
}

/// Status snapshot of a proxy filter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub main_pool: ServerPoolStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidate_pools: Vec<ServerPoolStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_pool: Option<ServerPoolStatus>,
}

/// The Proxy filter.
pub struct Proxy {
    main_pool: Arc<ServerPool>,
    candidate_pools: Vec<Arc<ServerPool>>,
    mirror_pool: Option<Arc<ServerPool>>,
}

impl Proxy {
    fn build(filter_spec: &FilterSpec, spec: ProxySpec) -> Result<Arc<dyn Filter>> {
        let transport = Arc::new(Transport::new(
            spec.max_idle_conns_per_host.min(spec.max_idle_conns),
            spec.mtls.as_ref(),
        )?);
        let compression = spec
            .compression
            .as_ref()
            .map(|c| Arc::new(Compression::new(c)));

        let mut main_pool = None;
        let mut candidate_pools = Vec::new();
        for pool_spec in &spec.pools {
            let pool_name = if pool_spec.filter.is_none() {
                format!("proxy#{}#main", filter_spec.name)
            } else {
                format!("proxy#{}#candidate#{}", filter_spec.name, candidate_pools.len())
            };
            let pool = ServerPool::new(
                pool_name,
                pool_spec,
                filter_spec,
                transport.clone(),
                compression.clone(),
                spec.server_max_body_size,
            )?;
            if pool_spec.filter.is_none() {
                main_pool = Some(pool);
            } else {
                candidate_pools.push(pool);
            }
        }

        let mirror_pool = spec
            .mirror_pool
            .as_ref()
            .map(|mirror_spec| {
                ServerPool::new(
                    format!("proxy#{}#mirror", filter_spec.name),
                    mirror_spec,
                    filter_spec,
                    transport.clone(),
                    None,
                    spec.server_max_body_size,
                )
            })
            .transpose()?;

        Ok(Arc::new(Proxy {
            main_pool: main_pool.ok_or_else(|| Error::internal("main pool missing"))?,
            candidate_pools,
            mirror_pool,
        }))
    }
}

#[async_trait]
impl Filter for Proxy {
    fn kind(&self) -> &'static str {
        KIND.name
    }

    async fn handle(&self, ctx: &mut Context) -> String {
        if let Some(mirror) = &self.mirror_pool {
            let matched = mirror
                .matcher
                .as_ref()
                .is_some_and(|m| m.matches(ctx));
            if matched {
                let mirror = mirror.clone();
                let request = ctx.request().clone();
                tokio::spawn(async move {
                    mirror.handle_mirror(request).await;
                });
            }
        }

        let pool = self
            .candidate_pools
            .iter()
            .find(|p| p.matcher.as_ref().is_some_and(|m| m.matches(ctx)))
            .unwrap_or(&self.main_pool);
        pool.handle(ctx).await
    }

    fn status(&self) -> serde_json::Value {
        let status = ProxyStatus {
            main_pool: self.main_pool.status(),
            candidate_pools: self.candidate_pools.iter().map(|p| p.status()).collect(),
            mirror_pool: self.mirror_pool.as_ref().map(|p| p.status()),
        };
        serde_json::to_value(status).unwrap_or(serde_json::Value::Null)
    }

    fn close(&self) {
        self.main_pool.close();
        for pool in &self.candidate_pools {
            pool.close();
        }
        if let Some(mirror) = &self.mirror_pool {
            mirror.close();
        }
    }
}
