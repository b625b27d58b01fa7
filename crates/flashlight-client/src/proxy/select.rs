//! Weighted random server selection with a per-request QoS floor.

use std::sync::Arc;

use hyper::header::HeaderName;
use hyper::HeaderMap;
use rand::Rng;

use super::upstream::ServerHandle;

/// Request header carrying the QoS floor the caller wants for this request.
pub static X_FLASHLIGHT_QOS: HeaderName = HeaderName::from_static("x-flashlight-qos");

/// QoS floor requested by this request: the `X-Flashlight-QOS` header parsed
/// as a non-negative integer, 0 when missing or malformed.
pub fn target_qos(headers: &HeaderMap) -> u32 {
    headers
        .get(&X_FLASHLIGHT_QOS)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Pick one server, weight-proportionally, skipping servers below the QoS
/// floor.
///
/// Single pass: draw a target in `[0, total_weight)` and walk the servers in
/// configured order. A server below the floor is excluded by shifting the
/// target past its weight slice, which re-normalises the draw over the
/// qualifying subset without a second pass. The last server is returned
/// unconditionally, so a floor nobody meets still yields a server.
pub fn pick<'a>(
    servers: &'a [Arc<ServerHandle>],
    total_weight: u32,
    target_qos: u32,
) -> &'a Arc<ServerHandle> {
    let mut t = rand::thread_rng().gen_range(0..total_weight);
    let mut aw = 0;
    for (i, server) in servers.iter().enumerate() {
        if i == servers.len() - 1 {
            // Last server: the default irrespective of the QoS floor.
            return server;
        }
        aw += server.weight();
        if server.qos() < target_qos {
            t += server.weight();
            continue;
        }
        if aw > t {
            return server;
        }
    }

    unreachable!("server selection walked past the last server");
}
