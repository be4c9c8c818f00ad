//! Propylon - a multi-protocol traffic gateway
//!
//! This crate accepts inbound traffic on HTTP/1, HTTP/2, raw TCP, raw UDP
//! and MQTT, and forwards it through user-defined filter pipelines to
//! configured upstream server pools.
//!
//! # Features
//!
//! - **Filter pipelines**: ordered chains of stateless filters with
//!   jump-on-result flow control and around-middleware composition
//! - **Server pools**: health-aware load balancing (round robin, random,
//!   weighted, ipHash, headerHash), retries, circuit breaking, mirroring
//!   and response caching
//! - **Hot reload**: new spec generations swap in without dropping
//!   compatible connections
//! - **MQTT broker**: durable sessions, qos-1 redelivery, wildcard routing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use propylon::{Gateway, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = std::fs::read_to_string("gateway.yaml")?;
//!     let gateway = Gateway::from_yaml(&config, Arc::new(MemoryStore::new())).await?;
//!     gateway.wait_running(std::time::Duration::from_secs(5)).await?;
//!     tokio::signal::ctrl_c().await?;
//!     gateway.close().await;
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod error;
pub mod filters;
pub mod fsm;
pub mod gate;
pub mod gateway;
pub mod ipfilter;
pub mod mqtt;
pub mod pipeline;
pub mod registry;
pub mod resilience;
pub mod spec;
pub mod stat;
pub mod store;

#[cfg(test)]
pub mod test_support;

pub use context::{Context, Protocol, Request, ResponseEntity};
pub use error::{Error, Result};
pub use gate::{GateState, GateStatus, HttpServer, TcpServer, UdpServer};
pub use gateway::Gateway;
pub use mqtt::MqttProxy;
pub use pipeline::Pipeline;
pub use registry::{FilterRegistry, PipelineMap};
pub use store::{MemoryStore, Storage};
