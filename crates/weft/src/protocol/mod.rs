pub mod msg;
pub mod text;
pub mod websocket;

use weft_codec::ByteWindow;
use weft_utils::ArrayVec;

use crate::{
    ctx::NetCtx,
    error::{NetError, NetResult},
    link::LinkCore,
    msg::{MsgPtr, NetMsg},
};

pub const MAX_PROTOCOLS: usize = 6;

/// One node of a link's pipeline.
///
/// Inbound traffic enters at the head and travels toward the tail through
/// `read` (bytes) and `read_msg` (messages); outbound traffic enters at the
/// tail and travels toward the head through `write_msg` and `write`. A node
/// only overrides the verbs it speaks; the rest answer `NotSupport`.
pub trait Protocol {
    fn start(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        let _ = p;
        Err(NetError::NotSupport)
    }

    fn read(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        let _ = (p, win);
        Err(NetError::NotSupport)
    }

    fn write(
        &mut self,
        p: &mut Pipeline<'_, '_>,
        data: &mut [u8],
        left: i64,
        total: i64,
    ) -> NetResult<()> {
        let _ = (p, data, left, total);
        Err(NetError::NotSupport)
    }

    fn read_msg(&mut self, p: &mut Pipeline<'_, '_>, msg: MsgPtr) -> NetResult<()> {
        let _ = (p, msg);
        Err(NetError::NotSupport)
    }

    fn write_msg(&mut self, p: &mut Pipeline<'_, '_>, msg: &mut NetMsg) -> NetResult<()> {
        let _ = (p, msg);
        Err(NetError::NotSupport)
    }

    fn end(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        let _ = p;
        Err(NetError::NotSupport)
    }
}

type Slot = Option<Box<dyn Protocol>>;

/// The ordered pipeline of a link, bounded at [`MAX_PROTOCOLS`] nodes.
///
/// The stack itself plays both sentinels: byte-level calls that walk past
/// the head land in the link's staging buffers, and message-level calls
/// that walk past the tail re-enter the link, closing the loop the way the
/// chain's two ends require.
pub struct ProtocolStack {
    slots: ArrayVec<Slot, MAX_PROTOCOLS>,
    writing_flag: u32,
}

impl Default for ProtocolStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolStack {
    pub fn new() -> Self {
        Self { slots: ArrayVec::new(), writing_flag: 0 }
    }

    pub fn push_protocol(&mut self, proto: Box<dyn Protocol>) -> NetResult<()> {
        if self.slots.try_push(Some(proto)).is_some() {
            return Err(NetError::LinkProtocolFull);
        }
        Ok(())
    }

    pub fn clear_protocol(&mut self) {
        self.slots.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Flag word of the message currently travelling down the write path.
    #[inline]
    pub fn writing_flag(&self) -> u32 {
        self.writing_flag
    }

    pub(crate) fn on_start(&mut self, core: &mut LinkCore, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if self.slots.is_empty() {
            return Err(NetError::LinkNoneProtocol);
        }
        self.with_slot(core, ctx, 0, |proto, p| proto.start(p))
    }

    pub(crate) fn on_read(
        &mut self,
        core: &mut LinkCore,
        ctx: &mut NetCtx<'_>,
        win: &mut ByteWindow<'_>,
    ) -> NetResult<()> {
        if self.slots.is_empty() {
            return Err(NetError::LinkNoneProtocol);
        }
        self.with_slot(core, ctx, 0, |proto, p| proto.read(p, win))
    }

    pub(crate) fn on_write(
        &mut self,
        core: &mut LinkCore,
        ctx: &mut NetCtx<'_>,
        msg: &mut NetMsg,
    ) -> NetResult<()> {
        if self.slots.is_empty() {
            return Err(NetError::LinkNoneProtocol);
        }
        self.writing_flag = msg.flag();
        let last = self.slots.len() - 1;
        self.with_slot(core, ctx, last, |proto, p| proto.write_msg(p, msg))
    }

    pub(crate) fn on_end(&mut self, core: &mut LinkCore, ctx: &mut NetCtx<'_>) {
        if self.slots.is_empty() {
            core.sentinel_end();
            return;
        }
        let last = self.slots.len() - 1;
        if let Err(err) = self.with_slot(core, ctx, last, |proto, p| proto.end(p)) {
            tracing::warn!(code = err.code(), "protocol teardown error");
        }
    }

    /// Takes the node at `idx` out of its slot, runs `f` with a pipeline
    /// positioned there, and restores it. Taking the node keeps the borrow
    /// unique while the node calls back through the chain.
    fn with_slot<R>(
        &mut self,
        core: &mut LinkCore,
        ctx: &mut NetCtx<'_>,
        idx: usize,
        f: impl FnOnce(&mut dyn Protocol, &mut Pipeline<'_, '_>) -> NetResult<R>,
    ) -> NetResult<R> {
        let mut proto = self
            .slots
            .get_mut(idx)
            .and_then(Option::take)
            .ok_or(NetError::LinkNoneProtocol)?;
        let res = {
            let mut p = Pipeline { stack: &mut *self, core, ctx, idx };
            f(proto.as_mut(), &mut p)
        };
        if let Some(slot) = self.slots.get_mut(idx) {
            *slot = Some(proto);
        }
        res
    }
}

/// A protocol node's view of its chain: the layers beside it plus the link
/// core behind the sentinels.
pub struct Pipeline<'a, 'c> {
    stack: &'a mut ProtocolStack,
    pub core: &'a mut LinkCore,
    pub ctx: &'a mut NetCtx<'c>,
    idx: usize,
}

impl Pipeline<'_, '_> {
    /// `start` on the next node; past the tail it re-enters the link.
    pub fn next_start(&mut self) -> NetResult<()> {
        if self.idx + 1 < self.stack.len() {
            self.stack.with_slot(self.core, self.ctx, self.idx + 1, |proto, p| proto.start(p))
        } else {
            self.core.sentinel_start()
        }
    }

    /// `read` on the next node; there is no byte-level tail, so the last
    /// node must consume or frame its input itself.
    pub fn next_read(&mut self, win: &mut ByteWindow<'_>) -> NetResult<()> {
        if self.idx + 1 < self.stack.len() {
            self.stack.with_slot(self.core, self.ctx, self.idx + 1, |proto, p| proto.read(p, win))
        } else {
            Err(NetError::NotSupport)
        }
    }

    /// `read_msg` on the next node; past the tail the message is delivered
    /// to the link.
    pub fn next_read_msg(&mut self, msg: MsgPtr) -> NetResult<()> {
        if self.idx + 1 < self.stack.len() {
            self.stack
                .with_slot(self.core, self.ctx, self.idx + 1, |proto, p| proto.read_msg(p, msg))
        } else {
            self.core.sentinel_read_msg(msg)
        }
    }

    /// `write` on the previous node; past the head the bytes land in the
    /// link's write staging buffer.
    pub fn pre_write(&mut self, data: &mut [u8], left: i64, total: i64) -> NetResult<()> {
        if self.idx > 0 {
            self.stack
                .with_slot(self.core, self.ctx, self.idx - 1, |proto, p| {
                    proto.write(p, data, left, total)
                })
        } else {
            self.core.push_data(self.ctx, data, left <= 0)
        }
    }

    /// `end` on the previous node; past the head the link enters teardown.
    pub fn pre_end(&mut self) -> NetResult<()> {
        if self.idx > 0 {
            self.stack.with_slot(self.core, self.ctx, self.idx - 1, |proto, p| proto.end(p))
        } else {
            self.core.sentinel_end();
            Ok(())
        }
    }
}

/// In-crate harness: the ambient pieces a pipeline needs, without a
/// reactor or sockets.
#[cfg(test)]
pub(crate) mod testkit {
    use rand::{SeedableRng, rngs::SmallRng};

    use crate::{buffer::BufferPool, config::NetConfig, ctx::NetCtx};

    pub(crate) struct TestNet {
        poll: mio::Poll,
        rng: SmallRng,
        buffers: BufferPool,
        pub config: NetConfig,
    }

    impl TestNet {
        pub fn new() -> Self {
            Self {
                poll: mio::Poll::new().unwrap(),
                rng: SmallRng::seed_from_u64(7),
                buffers: BufferPool::new(64 * 1024),
                config: NetConfig::default(),
            }
        }

        pub fn ctx(&mut self) -> NetCtx<'_> {
            NetCtx {
                config: &self.config,
                registry: self.poll.registry(),
                rng: &mut self.rng,
                buffers: &mut self.buffers,
                now_ms: weft_timing::steady_ms(),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Nop;
    impl Protocol for Nop {}

    #[test]
    fn stack_is_bounded() {
        let mut stack = ProtocolStack::new();
        for _ in 0..MAX_PROTOCOLS {
            stack.push_protocol(Box::new(Nop)).unwrap();
        }
        assert!(matches!(
            stack.push_protocol(Box::new(Nop)),
            Err(NetError::LinkProtocolFull)
        ));
        stack.clear_protocol();
        assert!(stack.is_empty());
    }
}
