//! Upstream servers and load-balance policies.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::spec::{LoadBalanceSpec, ServerSpec};

/// One upstream server with its probe-owned health flag.
#[derive(Debug)]
pub struct Server {
    pub url: String,
    pub weight: u32,
    pub tags: Vec<String>,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    healthy: AtomicBool,
    probe_fails: AtomicU32,
    probe_passes: AtomicU32,
}

impl Server {
    pub fn new(spec: &ServerSpec) -> Result<Self> {
        let (scheme, rest) = match spec.url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("tcp", spec.url.as_str()),
        };
        let use_tls = matches!(scheme, "https" | "tls");
        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| Error::spec(format!("invalid port in server url {:?}", spec.url)))?;
                (host.to_string(), port)
            }
            None => {
                let port = if use_tls { 443 } else { 80 };
                (authority.to_string(), port)
            }
        };
        if host.is_empty() {
            return Err(Error::spec(format!("invalid server url {:?}", spec.url)));
        }
        Ok(Self {
            url: spec.url.clone(),
            weight: spec.weight,
            tags: spec.tags.clone(),
            host,
            port,
            use_tls,
            healthy: AtomicBool::new(true),
            probe_fails: AtomicU32::new(0),
            probe_passes: AtomicU32::new(0),
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Record a probe failure; marks unhealthy after `threshold` in a row.
    pub fn probe_failed(&self, threshold: u32) {
        self.probe_passes.store(0, Ordering::Relaxed);
        let fails = self.probe_fails.fetch_add(1, Ordering::Relaxed) + 1;
        if fails >= threshold && self.healthy.swap(false, Ordering::Relaxed) {
            tracing::warn!(server = %self.url, fails, "server marked unhealthy");
        }
    }

    /// Record a probe success; marks healthy after `threshold` in a row.
    pub fn probe_passed(&self, threshold: u32) {
        self.probe_fails.store(0, Ordering::Relaxed);
        let passes = self.probe_passes.fetch_add(1, Ordering::Relaxed) + 1;
        if passes >= threshold && !self.healthy.swap(true, Ordering::Relaxed) {
            tracing::info!(server = %self.url, "server marked healthy");
        }
    }
}

/// Request attributes a policy may hash on.
#[derive(Debug, Default)]
pub struct BalanceKey<'a> {
    pub client_ip: Option<IpAddr>,
    pub header: Option<&'a str>,
}

/// A load-balance policy over the healthy subset of a pool.
pub trait Balancer: Send + Sync {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>>;
}

/// Build the policy named by the spec.
pub fn new_balancer(spec: &LoadBalanceSpec) -> Result<Box<dyn Balancer>> {
    spec.validate()?;
    match spec.policy.as_str() {
        "roundRobin" => Ok(Box::new(RoundRobin {
            counter: AtomicUsize::new(0),
        })),
        "random" => Ok(Box::new(Random)),
        "weighted" => Ok(Box::new(WeightedRandom)),
        "ipHash" => Ok(Box::new(IpHash)),
        "headerHash" => Ok(Box::new(HeaderHash)),
        other => Err(Error::spec(format!("unknown load balance policy {:?}", other))),
    }
}

struct RoundRobin {
    counter: AtomicUsize,
}

impl Balancer for RoundRobin {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        _key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        servers.get(n % servers.len())
    }
}

struct Random;

impl Balancer for Random {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        _key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        servers.get(rand::thread_rng().gen_range(0..servers.len()))
    }
}

struct WeightedRandom;

impl Balancer for WeightedRandom {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        _key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        let total: u64 = servers.iter().map(|s| u64::from(s.weight)).sum();
        if total == 0 {
            // All weights zero: uniform fallback.
            return servers.get(rand::thread_rng().gen_range(0..servers.len()));
        }
        let mut pick = rand::thread_rng().gen_range(0..total);
        for server in servers {
            let weight = u64::from(server.weight);
            if pick < weight {
                return Some(server);
            }
            pick -= weight;
        }
        servers.last()
    }
}

fn stable_hash(value: impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

struct IpHash;

impl Balancer for IpHash {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        let ip = key.client_ip?;
        servers.get((stable_hash(ip) % servers.len() as u64) as usize)
    }
}

struct HeaderHash;

impl Balancer for HeaderHash {
    fn select<'a>(
        &self,
        servers: &'a [Arc<Server>],
        key: &BalanceKey<'_>,
    ) -> Option<&'a Arc<Server>> {
        if servers.is_empty() {
            return None;
        }
        let value = key.header.unwrap_or("");
        servers.get((stable_hash(value) % servers.len() as u64) as usize)
    }
}
