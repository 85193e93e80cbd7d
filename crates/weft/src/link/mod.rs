pub mod factory;
pub mod mgr;

use std::{
    collections::VecDeque,
    io::{Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Token, net::TcpStream};

use crate::{
    GroupId, LinkId, LinkType,
    buffer::{BufferPool, FixedBuffer},
    ctx::NetCtx,
    error::{NetError, NetResult},
    msg::{MsgPtr, NetMsg},
    protocol::ProtocolStack,
};

/// Lifecycle of a link; transitions are monotonic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum LinkState {
    Invalid = 0,
    Opening = 1,
    Open = 2,
    Start = 3,
    End = 4,
    Close = 5,
}

/// The state a link and its protocol pipeline share: identity, lifecycle,
/// staging buffers, the kernel stream, and the effects a pipeline entry
/// stages for the reactor to collect afterwards.
pub struct LinkCore {
    link_id: LinkId,
    group_id: GroupId,
    is_server: bool,
    state: LinkState,
    close_reason: i32,
    last_alive: i64,
    alive_timer: i64,
    writing_size: i64,

    reader: Option<Box<FixedBuffer>>,
    writer: Option<Box<FixedBuffer>>,
    /// Rotated-out write buffers the kernel has not yet accepted. Each entry
    /// owns its buffer until fully drained, then returns it to the pool.
    pending_write: VecDeque<Box<FixedBuffer>>,

    stream: Option<TcpStream>,
    peer_addr: Option<SocketAddr>,
    writable_armed: bool,

    // Effects staged during a pipeline entry.
    inbox: Vec<MsgPtr>,
    needs_flush: bool,
    started: bool,
    ended: bool,
    opened: bool,
    teardown: bool,
    close_request: Option<i32>,
}

impl Default for LinkCore {
    fn default() -> Self {
        Self {
            link_id: 0,
            group_id: 0,
            is_server: false,
            state: LinkState::Invalid,
            close_reason: 0,
            last_alive: 0,
            alive_timer: 0,
            writing_size: 0,
            reader: None,
            writer: None,
            pending_write: VecDeque::new(),
            stream: None,
            peer_addr: None,
            writable_armed: false,
            inbox: Vec::new(),
            needs_flush: false,
            started: false,
            ended: false,
            opened: false,
            teardown: false,
            close_request: None,
        }
    }
}

impl LinkCore {
    #[inline]
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    #[inline]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn close_reason(&self) -> i32 {
        self.close_reason
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[inline]
    pub fn valid(&self) -> bool {
        matches!(self.state, LinkState::Opening | LinkState::Open | LinkState::Start)
    }

    #[inline]
    pub fn is_alive(&self, now_ms: i64, keepalive_ms: i64) -> bool {
        matches!(self.state, LinkState::Open | LinkState::Start)
            && now_ms - self.last_alive < keepalive_ms
    }

    #[inline]
    pub fn writing_size(&self) -> i64 {
        self.writing_size
    }

    #[inline]
    pub(crate) fn alive_timer(&self) -> i64 {
        self.alive_timer
    }

    #[inline]
    pub(crate) fn set_alive_timer(&mut self, timer_id: i64) {
        self.alive_timer = timer_id;
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        Token((self.link_id as usize) << 1)
    }

    /// Asks the reactor to close this link once the current pipeline entry
    /// unwinds (a WebSocket `Close` frame lands here).
    #[inline]
    pub fn request_close(&mut self, reason: i32) {
        if self.close_request.is_none() {
            self.close_request = Some(reason);
        }
    }

    // --- sentinels -------------------------------------------------------

    /// Tail sentinel for `start`: the pipeline is up, the link advances to
    /// `Start`.
    pub(crate) fn sentinel_start(&mut self) -> NetResult<()> {
        if self.state != LinkState::Open {
            return Err(NetError::StateError);
        }
        self.state = LinkState::Start;
        self.started = true;
        Ok(())
    }

    /// Tail sentinel for `read_msg`: stamps attribution and queues the
    /// message for the reactor's event fan-out.
    pub(crate) fn sentinel_read_msg(&mut self, mut msg: MsgPtr) -> NetResult<()> {
        if !self.valid() {
            return Err(NetError::StateError);
        }
        msg.set_group_id(self.group_id);
        msg.set_link_id(self.link_id);
        self.inbox.push(msg);
        Ok(())
    }

    /// Head sentinel for `end`: the pipeline has unwound, the link enters
    /// `End`.
    pub(crate) fn sentinel_end(&mut self) {
        if matches!(self.state, LinkState::Opening | LinkState::Open | LinkState::Start) {
            self.state = LinkState::End;
            self.ended = true;
        }
    }

    // --- write pipeline --------------------------------------------------

    /// Head sentinel for `write`: appends into the staging buffer, flushing
    /// synchronously whenever it fills so a burst larger than one buffer
    /// keeps its byte order.
    pub(crate) fn push_data(
        &mut self,
        ctx: &mut NetCtx<'_>,
        data: &[u8],
        _msg_end: bool,
    ) -> NetResult<()> {
        if !self.valid() || self.writer.is_none() {
            return Err(NetError::StateError);
        }
        let mut rest = data;
        loop {
            let writer = self.writer.as_mut().ok_or(NetError::StateError)?;
            let taken = writer.write(rest);
            rest = &rest[taken..];
            self.needs_flush = true;
            if rest.is_empty() {
                return Ok(());
            }
            self.flush(ctx)?;
        }
    }

    /// Submits the staging buffer to the kernel. A full buffer that cannot
    /// drain is rotated out to the pending queue (transferring ownership to
    /// the in-flight write) and replaced from the pool.
    pub(crate) fn flush(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if !self.valid() || self.writer.is_none() || self.stream.is_none() {
            return Err(NetError::StateError);
        }
        self.drain_pending(ctx)?;
        if !self.pending_write.is_empty() {
            if self.writer.as_ref().is_some_and(|w| w.free_size() == 0) {
                self.rotate_writer(ctx)?;
            }
            return Ok(());
        }
        loop {
            let writer = self.writer.as_mut().ok_or(NetError::StateError)?;
            if writer.is_empty() {
                return Ok(());
            }
            let stream = self.stream.as_mut().ok_or(NetError::StateError)?;
            match stream.write(writer.data()) {
                Ok(0) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                Ok(n) => writer.advance_read(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.arm_writable(ctx)?;
                    if self.writer.as_ref().is_some_and(|w| w.free_size() == 0) {
                        self.rotate_writer(ctx)?;
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drains rotated-out buffers in order, returning each to the pool once
    /// the kernel has taken all of it.
    fn drain_pending(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        loop {
            let Some(front) = self.pending_write.front_mut() else {
                return Ok(());
            };
            let stream = self.stream.as_mut().ok_or(NetError::StateError)?;
            match stream.write(front.data()) {
                Ok(0) => {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    front.advance_read(n);
                    let drained = front.is_empty();
                    self.finish_writing(n);
                    if drained
                        && let Some(buf) = self.pending_write.pop_front()
                    {
                        ctx.buffers.put(buf);
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.arm_writable(ctx)?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn rotate_writer(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        let full = self.writer.take().ok_or(NetError::StateError)?;
        weft_utils::safe_assert!(full.free_size() == 0, "rotating a staging buffer with free space");
        self.writing_size += full.size() as i64;
        self.pending_write.push_back(full);
        self.writer = Some(ctx.buffers.get());
        self.arm_writable(ctx)
    }

    fn finish_writing(&mut self, n: usize) {
        self.writing_size = (self.writing_size - n as i64).max(0);
    }

    /// Kernel says writable: drain the backlog, then the staging buffer,
    /// then stop asking for writable events.
    pub(crate) fn on_writable(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if !self.valid() {
            return Ok(());
        }
        self.flush(ctx)?;
        if self.pending_write.is_empty() && self.writer.as_ref().is_none_or(|w| w.is_empty()) {
            self.disarm_writable(ctx)?;
        }
        Ok(())
    }

    fn arm_writable(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if self.writable_armed {
            return Ok(());
        }
        let token = self.token();
        if let Some(stream) = self.stream.as_mut() {
            ctx.registry.reregister(stream, token, Interest::READABLE | Interest::WRITABLE)?;
            self.writable_armed = true;
        }
        Ok(())
    }

    fn disarm_writable(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if !self.writable_armed {
            return Ok(());
        }
        let token = self.token();
        if let Some(stream) = self.stream.as_mut() {
            ctx.registry.reregister(stream, token, Interest::READABLE)?;
            self.writable_armed = false;
        }
        Ok(())
    }

    /// Verdict on a non-blocking connect once the socket reports writable.
    /// On success the stream drops back to read interest.
    pub(crate) fn connect_result(&mut self, registry: &mio::Registry) -> Result<(), i32> {
        let token = self.token();
        let Some(stream) = self.stream.as_mut() else {
            return Err(NetError::StateError.code());
        };
        match stream.take_error() {
            Ok(Some(err)) | Err(err) => return Err(crate::error::io_code(&err)),
            Ok(None) => {}
        }
        if let Err(err) = stream.peer_addr() {
            return Err(crate::error::io_code(&err));
        }
        if let Err(err) = registry.reregister(stream, token, Interest::READABLE) {
            return Err(crate::error::io_code(&err));
        }
        self.writable_armed = false;
        Ok(())
    }

    /// Best-effort drain of staged teardown bytes (a WebSocket close frame
    /// lands here); errors and backpressure end the attempt.
    pub(crate) fn flush_teardown(&mut self, ctx: &mut NetCtx<'_>) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        loop {
            let Some(front) = self.pending_write.front_mut() else {
                break;
            };
            match stream.write(front.data()) {
                Ok(n) if n > 0 => {
                    front.advance_read(n);
                    if front.is_empty()
                        && let Some(buf) = self.pending_write.pop_front()
                    {
                        ctx.buffers.put(buf);
                    }
                }
                _ => return,
            }
        }
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        while !writer.is_empty() {
            match stream.write(writer.data()) {
                Ok(n) if n > 0 => writer.advance_read(n),
                _ => return,
            }
        }
    }

    /// Deregisters and shuts the kernel side down.
    pub(crate) fn detach_stream(&mut self, registry: &mio::Registry) {
        if let Some(mut stream) = self.stream.take() {
            let _ = registry.deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    // --- staged effects --------------------------------------------------

    pub(crate) fn take_started(&mut self) -> bool {
        std::mem::take(&mut self.started)
    }

    pub(crate) fn take_ended(&mut self) -> bool {
        std::mem::take(&mut self.ended)
    }

    pub(crate) fn take_inbox(&mut self) -> Vec<MsgPtr> {
        std::mem::take(&mut self.inbox)
    }

    pub(crate) fn take_needs_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    pub(crate) fn take_close_request(&mut self) -> Option<i32> {
        self.close_request.take()
    }

    pub(crate) fn in_teardown(&self) -> bool {
        self.teardown
    }

    pub(crate) fn opened(&self) -> bool {
        self.opened
    }
}

/// One transport endpoint: the link core plus its protocol pipeline, tagged
/// with the factory key that recycles it.
pub struct Link {
    pub(crate) core: LinkCore,
    pub(crate) stack: ProtocolStack,
    pub(crate) kind: LinkType,
}

impl Link {
    pub(crate) fn new(kind: LinkType) -> Self {
        Self { core: LinkCore::default(), stack: ProtocolStack::new(), kind }
    }

    #[inline]
    pub fn link_id(&self) -> LinkId {
        self.core.link_id
    }

    #[inline]
    pub fn group_id(&self) -> GroupId {
        self.core.group_id
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.core.state
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.core.is_server
    }

    #[inline]
    pub fn close_reason(&self) -> i32 {
        self.core.close_reason
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer_addr
    }

    /// Acquires the staging buffers; reused links keep their previous
    /// allocations.
    pub(crate) fn init(&mut self, ctx: &mut NetCtx<'_>) {
        self.core.close_reason = 0;
        match self.core.reader.as_mut() {
            Some(reader) => reader.clear(),
            None => self.core.reader = Some(ctx.buffers.get()),
        }
        match self.core.writer.as_mut() {
            Some(writer) => writer.clear(),
            None => self.core.writer = Some(ctx.buffers.get()),
        }
    }

    /// Stamped by the registry when the link is added.
    pub(crate) fn reset_id(&mut self, group_id: GroupId, link_id: LinkId, is_server: bool) {
        self.core.group_id = group_id;
        self.core.link_id = link_id;
        self.core.is_server = is_server;
        self.core.state = LinkState::Opening;
    }

    pub(crate) fn attach_stream(
        &mut self,
        ctx: &mut NetCtx<'_>,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        interest: Interest,
    ) -> NetResult<()> {
        stream.set_nodelay(true)?;
        if let Some(size) = ctx.config.socket_buf_size {
            set_socket_buf_size(&stream, size);
        }
        ctx.registry.register(&mut stream, self.core.token(), interest)?;
        self.core.writable_armed = interest.is_writable();
        self.core.stream = Some(stream);
        self.core.peer_addr = Some(peer_addr);
        Ok(())
    }

    /// Read-ready for the first time: the link is open and the pipeline
    /// gets its `start` pass.
    pub(crate) fn on_open(&mut self, ctx: &mut NetCtx<'_>) {
        self.core.state = LinkState::Open;
        self.core.last_alive = ctx.now_ms;
        self.core.opened = true;
    }

    pub(crate) fn start(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        self.stack.on_start(&mut self.core, ctx)
    }

    /// Pulls every readable byte off the kernel, running the pipeline once
    /// per chunk. The staging buffer is recycled between chunks because the
    /// pipeline buffers partial frames internally.
    pub(crate) fn on_readable(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        loop {
            if !self.core.valid() {
                return Ok(());
            }
            let n = {
                let stream = self.core.stream.as_mut().ok_or(NetError::StateError)?;
                let reader = self.core.reader.as_mut().ok_or(NetError::StateError)?;
                match stream.read(reader.free_mut()) {
                    Ok(0) => {
                        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                }
            };
            self.core.reader.as_mut().ok_or(NetError::StateError)?.advance_write(n);
            self.read(ctx)?;
            if let Some(reader) = self.core.reader.as_mut() {
                reader.clear();
            }
        }
    }

    /// Kernel bytes just landed in the read buffer; hand them to the head
    /// of the pipeline.
    pub(crate) fn read(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        if !self.core.valid() {
            return Err(NetError::StateError);
        }
        let Some(mut reader) = self.core.reader.take() else {
            return Err(NetError::StateError);
        };
        self.core.last_alive = ctx.now_ms;
        let res = {
            let mut win = weft_codec::ByteWindow::new(reader.data_mut());
            self.stack.on_read(&mut self.core, ctx, &mut win)
        };
        self.core.reader = Some(reader);
        res
    }

    /// Only valid in `Start`; enters the pipeline at the tail.
    pub(crate) fn send_msg(&mut self, ctx: &mut NetCtx<'_>, msg: &mut NetMsg) -> NetResult<()> {
        if self.core.state != LinkState::Start {
            return Err(NetError::StateError);
        }
        self.stack.on_write(&mut self.core, ctx, msg)
    }

    /// Begins teardown, recording the reason; the pipeline unwinds from the
    /// tail and the link lands in `End`.
    pub(crate) fn close(&mut self, ctx: &mut NetCtx<'_>, reason: i32) -> NetResult<()> {
        if !self.core.valid() {
            return Err(NetError::StateError);
        }
        self.core.close_reason = reason;
        self.core.teardown = true;
        self.stack.on_end(&mut self.core, ctx);
        Ok(())
    }

    /// Kernel-side close completed.
    pub(crate) fn on_close(&mut self) {
        self.core.state = LinkState::Close;
    }

    pub(crate) fn flush(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        self.core.flush(ctx)
    }

    pub(crate) fn on_writable(&mut self, ctx: &mut NetCtx<'_>) -> NetResult<()> {
        self.core.on_writable(ctx)
    }

    /// Returns every pooled resource and drops the stream, leaving the link
    /// ready for its factory pool. The protocol stack stays built; each
    /// layer resets itself on the next `start`.
    pub(crate) fn clear(&mut self, buffers: &mut BufferPool) {
        if let Some(reader) = self.core.reader.take() {
            buffers.put(reader);
        }
        if let Some(writer) = self.core.writer.take() {
            buffers.put(writer);
        }
        while let Some(buf) = self.core.pending_write.pop_front() {
            buffers.put(buf);
        }
        self.core.stream = None;
        self.core.peer_addr = None;
        let kind = self.kind;
        let stack = std::mem::take(&mut self.stack);
        *self = Link { core: LinkCore::default(), stack, kind };
    }
}

#[cfg(test)]
impl LinkCore {
    /// A core in `Open` with a staging buffer and no kernel stream, enough
    /// to drive a protocol stack in isolation.
    pub(crate) fn test_open(writer: Box<FixedBuffer>) -> Self {
        let mut core = Self::default();
        core.state = LinkState::Open;
        core.link_id = 1;
        core.writer = Some(writer);
        core
    }

    pub(crate) fn test_set_server(&mut self, is_server: bool) {
        self.is_server = is_server;
    }

    /// Drains whatever the pipeline staged for the kernel.
    pub(crate) fn test_writer_take(&mut self) -> Vec<u8> {
        let writer = self.writer.as_mut().expect("test core has a writer");
        let bytes = writer.data().to_vec();
        writer.clear();
        self.needs_flush = false;
        bytes
    }
}

/// Set kernel SO_SNDBUF and SO_RCVBUF on a mio TcpStream.
pub(crate) fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            (&raw const size).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const size).cast::<libc::c_void>(),
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
