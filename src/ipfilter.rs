//! IP allow/deny filtering for gate listeners.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Spec of an IP filter: allow and block lists of IPs or CIDR blocks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IpFilterSpec {
    #[serde(default)]
    pub block_by_default: bool,

    #[serde(default)]
    pub allow_ips: Vec<String>,

    #[serde(default)]
    pub block_ips: Vec<String>,
}

/// A compiled IP filter.
///
/// The allow list always wins over the block list; with `blockByDefault`
/// only allow-listed addresses pass.
#[derive(Debug, Clone)]
pub struct IpFilter {
    block_by_default: bool,
    allow: Vec<Cidr>,
    block: Vec<Cidr>,
}

#[derive(Debug, Clone, Copy)]
struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    fn parse(s: &str) -> Result<Self> {
        let (addr_str, prefix) = match s.split_once('/') {
            Some((a, p)) => {
                let prefix: u8 = p
                    .parse()
                    .map_err(|_| Error::spec(format!("invalid CIDR prefix in {:?}", s)))?;
                (a, Some(prefix))
            }
            None => (s, None),
        };
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| Error::spec(format!("invalid IP address {:?}", s)))?;
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(Error::spec(format!("CIDR prefix too large in {:?}", s)));
        }
        Ok(Cidr { addr, prefix })
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let net = u32::from(net);
                let ip = u32::from(ip);
                let shift = 32 - u32::from(self.prefix);
                if shift == 32 {
                    true
                } else {
                    (net >> shift) == (ip >> shift)
                }
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let net = u128::from(net);
                let ip = u128::from(ip);
                let shift = 128 - u32::from(self.prefix);
                if shift == 128 {
                    true
                } else {
                    (net >> shift) == (ip >> shift)
                }
            }
            _ => false,
        }
    }
}

impl IpFilter {
    pub fn new(spec: &IpFilterSpec) -> Result<Self> {
        let allow = spec
            .allow_ips
            .iter()
            .map(|s| Cidr::parse(s))
            .collect::<Result<Vec<_>>>()?;
        let block = spec
            .block_ips
            .iter()
            .map(|s| Cidr::parse(s))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            block_by_default: spec.block_by_default,
            allow,
            block,
        })
    }

    /// Whether the given address may pass.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if self.allow.iter().any(|c| c.contains(ip)) {
            return true;
        }
        if self.block.iter().any(|c| c.contains(ip)) {
            return false;
        }
        !self.block_by_default
    }
}
