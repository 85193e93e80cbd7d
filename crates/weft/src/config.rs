use serde::{Deserialize, Serialize};

/// Reactor configuration, passed once at start.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Capacity of each read/write staging buffer.
    pub tcp_buffer_size: usize,
    /// Liveness check interval and threshold in ms; `0` disables keepalive.
    pub keepalive_ms: i64,
    /// Lifetime of a pending request awaiting a response (threaded facade).
    pub req_timeout_ms: i64,
    /// Upper bound on a framed message payload.
    pub msg_body_max: usize,
    /// Kernel SO_SNDBUF / SO_RCVBUF override for every stream.
    pub socket_buf_size: Option<usize>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tcp_buffer_size: 64 * 1024,
            keepalive_ms: 0,
            req_timeout_ms: 5_000,
            msg_body_max: 16 * 1024 * 1024,
            socket_buf_size: None,
        }
    }
}
