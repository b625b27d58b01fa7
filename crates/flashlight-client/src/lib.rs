//! Local HTTP/HTTPS proxy that relays traffic through host-spoofing upstream
//! servers.
//!
//! Browsers point at the local listener; each request is forwarded to one of
//! the configured upstream servers over a TLS connection established against
//! a front domain, with the traffic itself encapsulated as HTTP
//! request/response pairs by the `enproxy` transport.

pub mod config;
pub mod proxy;

pub use config::{ClientConfig, FileConfig, ServerInfo};
pub use proxy::Client;
