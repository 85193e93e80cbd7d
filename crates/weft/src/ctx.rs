use mio::Registry;
use rand::rngs::SmallRng;

use crate::{buffer::BufferPool, config::NetConfig};

/// Ambient reactor state threaded through every link operation.
///
/// Built on the stack by the reactor for the duration of one call, so links
/// and protocol layers can rotate buffers, re-register interest and draw
/// randomness without holding a reference back to the reactor itself.
pub struct NetCtx<'a> {
    pub config: &'a NetConfig,
    pub registry: &'a Registry,
    pub rng: &'a mut SmallRng,
    pub buffers: &'a mut BufferPool,
    pub now_ms: i64,
}
