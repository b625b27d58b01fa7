//! Per-upstream server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Selection weight used when a server does not specify one.
pub const DEFAULT_WEIGHT: u32 = 100;
/// TCP dial deadline used when a server does not specify one.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// TCP keepalive probe interval used when a server does not specify one.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(70);

/// Configuration for one upstream server.
///
/// `host` is the real origin the upstream is addressed as — it ends up in the
/// `Host` header of every tunnelled request. When `masquerade_as` is set, DNS
/// resolution and certificate verification use that front domain instead, so
/// the outer TLS connection looks like ordinary traffic to the front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Real origin host (e.g. `getiantem.org`).
    pub host: String,

    /// TCP port of the front endpoint.
    #[serde(default)]
    pub port: u16,

    /// Host to masquerade as for host-spoofing (e.g. `cdnjs.com`). When unset
    /// or empty, `host` is used for dialing and verification too.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masquerade_as: Option<String>,

    /// PEM-encoded certificate trusted to sign the server's certificate.
    /// When set, it is the sole trust anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_ca: Option<String>,

    /// Skip certificate verification entirely (testing only).
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// TCP dial deadline in milliseconds; 0 means 5000.
    #[serde(default)]
    pub dial_timeout_millis: u64,

    /// TCP keepalive probe interval in milliseconds; 0 means 70000.
    #[serde(default)]
    pub keep_alive_millis: u64,

    /// Relative selection weight versus other servers; 0 means 100.
    #[serde(default)]
    pub weight: u32,

    /// Relative quality of service, higher is better.
    #[serde(default)]
    pub qos: u32,
}

impl ServerInfo {
    /// The host the outer TLS connection is established against.
    pub fn front_host(&self) -> &str {
        self.masquerade_as
            .as_deref()
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.host)
    }

    /// `host:port` address to dial for reaching the server.
    pub fn front_addr(&self) -> String {
        format!("{}:{}", self.front_host(), self.port)
    }

    pub fn dial_timeout(&self) -> Duration {
        millis_or(self.dial_timeout_millis, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn keep_alive(&self) -> Duration {
        millis_or(self.keep_alive_millis, DEFAULT_KEEP_ALIVE)
    }

    pub fn weight(&self) -> u32 {
        if self.weight == 0 {
            DEFAULT_WEIGHT
        } else {
            self.weight
        }
    }
}

fn millis_or(millis: u64, fallback: Duration) -> Duration {
    if millis == 0 {
        fallback
    } else {
        Duration::from_millis(millis)
    }
}
