//! The client proxy implementation.
//!
//! # Module structure
//!
//! - `server` - the [`Client`]: listener shell, request dispatch, and atomic
//!   reconfiguration of the server set
//! - `select` - weighted random server selection with a per-request QoS floor
//! - `upstream` - per-server handle: tunnel config, HTTP forwarding path
//! - `tls` - TLS dialing with suppressed SNI and front-pinned verification

mod select;
mod server;
mod tls;
mod upstream;


pub use select::X_FLASHLIGHT_QOS;
pub use server::Client;
pub use tls::FrontedDialer;
pub use upstream::{error_response, ServerHandle};
