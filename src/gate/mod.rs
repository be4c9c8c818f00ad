//! Traffic gates: listener-owning runtime objects.

pub mod http;
pub mod l4;
pub mod limit;
pub mod mux;
pub mod tcp;
pub mod udp;

pub use http::{GateState, GateStatus, HttpServer};
pub use tcp::TcpServer;
pub use udp::UdpServer;
