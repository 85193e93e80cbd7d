pub mod process;
pub(crate) mod resolver;
pub mod thread;

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, net::TcpListener, net::TcpStream};
use rand::{SeedableRng, rngs::SmallRng};
use weft_codec::MsgBuffer;
use weft_timing::{TimerWheel, steady_ms};
use weft_utils::Event;

use crate::{
    BroadcastDest, GroupId, LinkId, LinkType,
    buffer::BufferPool,
    config::NetConfig,
    ctx::NetCtx,
    error::{NetError, NetResult, SUCCESS, io_code},
    link::{factory::LinkFactory, mgr, mgr::LinkMgr},
    msg::{MsgPtr, SendFlag},
    reactor::resolver::{ResolveDone, ResolveId, Resolver},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ReactorState {
    Invalid,
    Valid,
    Closing,
}

pub struct LinkOpenArgs {
    pub group_id: GroupId,
    pub link_id: LinkId,
    pub addr: SocketAddr,
}

pub struct LinkStartArgs {
    pub group_id: GroupId,
    pub link_id: LinkId,
}

/// The listener takes the message; anything left when dispatch finishes is
/// recycled.
pub struct LinkMsgArgs {
    pub group_id: GroupId,
    pub link_id: LinkId,
    pub msg: Option<MsgPtr>,
}

pub struct LinkEndArgs {
    pub group_id: GroupId,
    pub link_id: LinkId,
    pub reason: i32,
}

pub struct LinkCloseArgs {
    pub group_id: GroupId,
    pub link_id: LinkId,
    pub reason: i32,
}

#[derive(Clone)]
enum TimerEvent {
    KeepAlive(LinkId),
}

struct Listener {
    group_id: GroupId,
    link_type: LinkType,
    listener: TcpListener,
}

type FrameFn = Box<dyn FnOnce(&mut Reactor)>;
type ConnectCb = Box<dyn FnOnce(i32, GroupId, LinkId)>;
type HostIpCb = Box<dyn FnOnce(i32, &str)>;

enum AfterResolve {
    Connect { link_type: LinkType, group_id: GroupId, port: u16, cb: ConnectCb },
    HostIp { cb: HostIpCb },
}

/// Builds a [`NetCtx`] from disjoint reactor fields, leaving `links`,
/// `timer` and the event slots free to borrow alongside it.
macro_rules! net_ctx {
    ($self:expr) => {
        NetCtx {
            config: &$self.config,
            registry: $self.poll.registry(),
            rng: &mut $self.rng,
            buffers: &mut $self.buffers,
            now_ms: steady_ms(),
        }
    };
}

/// The event loop: one mio poll multiplexing every link and listener, the
/// link registry, the timer wheel, the per-reactor pools, and a next-frame
/// queue of deferred work. Everything here runs on exactly one thread.
///
/// Five lifecycle events fan out to subscribers; a listener that returns
/// `false` removes itself. Links are freed only from the next-frame queue,
/// one tick after their close completion, so no upcall holds a dangling
/// link.
pub struct Reactor {
    state: ReactorState,
    config: NetConfig,
    poll: Poll,
    events: Events,
    links: LinkMgr,
    listeners: Vec<Option<Listener>>,
    connecting: HashMap<LinkId, ConnectCb>,
    timer: TimerWheel<TimerEvent>,
    rng: SmallRng,
    buffers: BufferPool,
    resolver: Resolver,
    resolve_waiting: HashMap<ResolveId, AfterResolve>,
    ready_frame: Vec<FrameFn>,
    work_frame: Vec<FrameFn>,

    pub event_link_open: Event<LinkOpenArgs>,
    pub event_link_start: Event<LinkStartArgs>,
    pub event_link_msg: Event<LinkMsgArgs>,
    pub event_link_end: Event<LinkEndArgs>,
    pub event_link_close: Event<LinkCloseArgs>,
}

impl Reactor {
    const EVENTS_CAPACITY: usize = 1024;

    pub fn new(config: NetConfig) -> NetResult<Self> {
        let poll = Poll::new()?;
        let buffers = BufferPool::new(config.tcp_buffer_size);
        Ok(Self {
            state: ReactorState::Valid,
            config,
            poll,
            events: Events::with_capacity(Self::EVENTS_CAPACITY),
            links: LinkMgr::new(),
            listeners: Vec::new(),
            connecting: HashMap::new(),
            timer: TimerWheel::new(),
            rng: SmallRng::from_os_rng(),
            buffers,
            resolver: Resolver::new(),
            resolve_waiting: HashMap::new(),
            ready_frame: Vec::new(),
            work_frame: Vec::new(),
            event_link_open: Event::new(),
            event_link_start: Event::new(),
            event_link_msg: Event::new(),
            event_link_end: Event::new(),
            event_link_close: Event::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    #[inline]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Defers work to the next tick; the only place links are freed.
    pub fn add_next_frame(&mut self, f: FrameFn) {
        if self.state == ReactorState::Invalid {
            return;
        }
        self.ready_frame.push(f);
    }

    /// One tick: advance timers, flush pending writes, pump the poll
    /// without blocking, resolve finished lookups, run the deferred frame.
    pub fn update(&mut self, delta_ms: i64) {
        if self.state == ReactorState::Invalid {
            return;
        }

        let mut fired = Vec::new();
        self.timer.advance(delta_ms, &mut fired);
        for (timer_id, event) in fired {
            match event {
                TimerEvent::KeepAlive(link_id) => self.check_keepalive(timer_id, link_id),
            }
        }

        let failed = {
            let mut ctx = net_ctx!(self);
            self.links.flush_links(&mut ctx)
        };
        for (link_id, code) in failed {
            self.close_link_inner(link_id, code);
        }

        let mut events = std::mem::replace(&mut self.events, Events::with_capacity(0));
        if let Err(err) = self.poll.poll(&mut events, Some(Duration::ZERO)) {
            tracing::error!(?err, "reactor poll failed");
        }
        for event in &events {
            self.handle_event(event);
        }
        self.events = events;

        let mut done = Vec::new();
        self.resolver.drain(&mut done);
        for d in done {
            self.on_resolved(d);
        }

        let work = std::mem::take(&mut self.work_frame);
        for f in work {
            f(self);
        }
        std::mem::swap(&mut self.ready_frame, &mut self.work_frame);
    }

    /// Shuts listeners, closes every link, and pumps the loop until no
    /// handle is left, then tears the reactor down for good.
    pub fn release(&mut self) {
        if self.state != ReactorState::Valid {
            return;
        }
        self.state = ReactorState::Closing;

        for slot in 0..self.listeners.len() {
            self.drop_listener(slot);
        }
        self.connecting.clear();
        self.resolve_waiting.clear();
        self.close_all_links(SUCCESS);

        let mut guard = 0;
        while !self.links.is_empty()
            || !self.work_frame.is_empty()
            || !self.ready_frame.is_empty()
        {
            self.update(1);
            guard += 1;
            if guard > 10_000 {
                weft_utils::safe_panic!("reactor release did not converge");
                break;
            }
        }

        self.resolver.shutdown();
        self.timer = TimerWheel::new();
        self.event_link_open.clear();
        self.event_link_start.clear();
        self.event_link_msg.clear();
        self.event_link_end.clear();
        self.event_link_close.clear();
        self.state = ReactorState::Invalid;
    }

    // --- listening -------------------------------------------------------

    pub fn listen_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        ip: &str,
        port: u16,
    ) -> NetResult<()> {
        if self.state != ReactorState::Valid {
            return Err(NetError::StateError);
        }
        let ip: IpAddr = ip.parse().map_err(|_| NetError::SockAddrInvalid)?;
        let mut listener = TcpListener::bind(SocketAddr::new(ip, port))?;
        let slot = self.listeners.len();
        self.poll.registry().register(
            &mut listener,
            listener_token(slot),
            Interest::READABLE,
        )?;
        self.listeners.push(Some(Listener { group_id, link_type, listener }));
        tracing::debug!(group_id, port, "listening");
        Ok(())
    }

    /// Drops every listening endpoint carrying the group tag.
    pub fn stop_listen_tcp(&mut self, group_id: GroupId) {
        if self.state != ReactorState::Valid {
            return;
        }
        for slot in 0..self.listeners.len() {
            if self.listeners[slot].as_ref().is_some_and(|l| l.group_id == group_id) {
                self.drop_listener(slot);
            }
        }
    }

    fn drop_listener(&mut self, slot: usize) {
        if let Some(mut entry) = self.listeners[slot].take() {
            let _ = self.poll.registry().deregister(&mut entry.listener);
        }
    }

    // --- connecting ------------------------------------------------------

    /// Resolves `host`, allocates a link of the given variant and starts a
    /// kernel connect. `cb` fires exactly once from this thread.
    pub fn connect_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        host: &str,
        port: u16,
        cb: impl FnOnce(i32, GroupId, LinkId) + 'static,
    ) {
        if host.is_empty() || port == 0 {
            cb(NetError::InvalidArg.code(), 0, 0);
            return;
        }
        if self.state != ReactorState::Valid {
            cb(NetError::StateError.code(), 0, 0);
            return;
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => {
                self.connect_addr(link_type, group_id, SocketAddr::new(ip, port), Box::new(cb));
            }
            Err(_) => {
                let id = self.resolver.lookup(host);
                self.resolve_waiting
                    .insert(id, AfterResolve::Connect { link_type, group_id, port, cb: Box::new(cb) });
            }
        }
    }

    fn connect_addr(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        addr: SocketAddr,
        cb: ConnectCb,
    ) {
        if self.state != ReactorState::Valid {
            cb(NetError::StateError.code(), 0, 0);
            return;
        }
        let Some(mut link) = LinkFactory::get(link_type) else {
            cb(NetError::MemoryNotEnough.code(), 0, 0);
            return;
        };
        {
            let mut ctx = net_ctx!(self);
            link.init(&mut ctx);
        }
        let link_id = match self.links.add_link(link, group_id, false) {
            Ok(id) => id,
            Err(err) => {
                cb(err.code(), 0, 0);
                return;
            }
        };
        let stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(err) => {
                cb(io_code(&err), group_id, link_id);
                self.discard_link(link_id);
                return;
            }
        };
        let attached = {
            let mut ctx = net_ctx!(self);
            match self.links.find_link_mut(link_id) {
                Some(link) => {
                    link.attach_stream(&mut ctx, stream, addr, Interest::READABLE | Interest::WRITABLE)
                }
                None => Err(NetError::NotFoundLink),
            }
        };
        if let Err(err) = attached {
            cb(err.code(), group_id, link_id);
            self.discard_link(link_id);
            return;
        }
        self.connecting.insert(link_id, cb);
    }

    fn handle_connect_ready(&mut self, link_id: LinkId) {
        let Some(cb) = self.connecting.remove(&link_id) else {
            return;
        };
        let group_id = self.links.find_link(link_id).map(|l| l.group_id()).unwrap_or(0);
        let verdict = match self.links.find_link_mut(link_id) {
            Some(link) => link.core.connect_result(self.poll.registry()),
            None => Err(NetError::NotFoundLink.code()),
        };
        match verdict {
            Ok(()) => {
                self.open_link(link_id);
                cb(SUCCESS, group_id, link_id);
            }
            Err(code) => {
                cb(code, group_id, link_id);
                self.discard_link(link_id);
            }
        }
    }

    /// Removes a link that never opened: no events, straight back to the
    /// pools via the next frame.
    fn discard_link(&mut self, link_id: LinkId) {
        self.add_next_frame(Box::new(move |r| r.free_link(link_id)));
    }

    // --- lookups ---------------------------------------------------------

    pub fn get_host_ip(&mut self, host: &str, cb: impl FnOnce(i32, &str) + 'static) {
        if host.is_empty() {
            cb(NetError::InvalidArg.code(), "");
            return;
        }
        if self.state != ReactorState::Valid {
            cb(NetError::StateError.code(), "");
            return;
        }
        let id = self.resolver.lookup(host);
        self.resolve_waiting.insert(id, AfterResolve::HostIp { cb: Box::new(cb) });
    }

    fn on_resolved(&mut self, done: ResolveDone) {
        let Some(waiting) = self.resolve_waiting.remove(&done.id) else {
            return;
        };
        match waiting {
            AfterResolve::HostIp { cb } => match done.result {
                Ok(ip) => cb(SUCCESS, &ip.to_string()),
                Err(code) => cb(code, ""),
            },
            AfterResolve::Connect { link_type, group_id, port, cb } => match done.result {
                Ok(ip) => self.connect_addr(link_type, group_id, SocketAddr::new(ip, port), cb),
                Err(code) => cb(code, 0, 0),
            },
        }
    }

    // --- sending ---------------------------------------------------------

    pub fn send_msg(&mut self, mut msg: MsgPtr) -> NetResult<()> {
        msg.set_send_flag(SendFlag::Single);
        let mut ctx = net_ctx!(self);
        self.links.send_msg(&mut ctx, &mut msg)
    }

    /// Encodes the destination map in front of the body and hands the
    /// message to the multi-send dispatcher, so both facades share one
    /// fan-out decoder.
    pub fn broadcast_msg(&mut self, dest: &BroadcastDest, mut msg: MsgPtr) -> NetResult<()> {
        msg.set_send_flag(SendFlag::Multi);
        let mut buf = MsgBuffer::new();
        mgr::encode_broadcast_dest(dest, &mut buf);
        buf.write(msg.body());
        msg.replace_buffer(buf);
        self.auto_send_msg(msg)
    }

    /// Dispatches on the message's send flag.
    pub fn auto_send_msg(&mut self, msg: MsgPtr) -> NetResult<()> {
        let mut ctx = net_ctx!(self);
        self.links.auto_send_msg(&mut ctx, msg)
    }

    // --- closing ---------------------------------------------------------

    pub fn close_link(&mut self, link_id: LinkId, reason: i32) {
        if self.state != ReactorState::Valid {
            return;
        }
        self.close_link_inner(link_id, reason);
    }

    /// Teardown of every registered link, in id order.
    pub fn close_all_links(&mut self, reason: i32) {
        let mut ids = self.links.link_ids();
        ids.sort_unstable();
        for link_id in ids {
            self.close_link_inner(link_id, reason);
        }
    }

    fn close_link_inner(&mut self, link_id: LinkId, reason: i32) {
        let closed = {
            let mut ctx = net_ctx!(self);
            match self.links.find_link_mut(link_id) {
                Some(link) if !link.core.in_teardown() => link.close(&mut ctx, reason),
                _ => return,
            }
        };
        if let Err(err) = closed {
            tracing::warn!(link_id, code = err.code(), "link close failed");
            return;
        }
        self.finish_link(link_id);
    }

    /// Runs close completion: end event, best-effort flush of staged
    /// teardown bytes, kernel shutdown, close event, deferred free.
    fn finish_link(&mut self, link_id: LinkId) {
        let Some(link) = self.links.find_link_mut(link_id) else {
            return;
        };
        let group_id = link.group_id();
        let reason = link.close_reason();
        let opened = link.core.opened();
        let ended = link.core.take_ended();
        let alive_timer = link.core.alive_timer();
        link.core.set_alive_timer(0);

        if ended && opened {
            self.event_link_end.notify(&mut LinkEndArgs { group_id, link_id, reason });
        }

        {
            let mut ctx = net_ctx!(self);
            if let Some(link) = self.links.find_link_mut(link_id) {
                link.core.flush_teardown(&mut ctx);
                link.core.detach_stream(ctx.registry);
            }
        }

        if let Some(link) = self.links.find_link_mut(link_id) {
            link.on_close();
        }
        if alive_timer > 0 {
            self.timer.cancel(alive_timer);
        }
        if opened {
            self.event_link_close.notify(&mut LinkCloseArgs { group_id, link_id, reason });
        }
        self.add_next_frame(Box::new(move |r| r.free_link(link_id)));
    }

    fn free_link(&mut self, link_id: LinkId) {
        if let Some(mut link) = self.links.remove_link(link_id) {
            link.clear(&mut self.buffers);
            LinkFactory::put(link);
        }
    }

    // --- event plumbing --------------------------------------------------

    fn handle_event(&mut self, event: &mio::event::Event) {
        let token = event.token();
        if token.0 & 1 == 1 {
            self.handle_accept(token.0 >> 1);
            return;
        }
        let link_id = (token.0 >> 1) as LinkId;
        if self.connecting.contains_key(&link_id) {
            self.handle_connect_ready(link_id);
            return;
        }

        if event.is_readable() {
            let res = {
                let mut ctx = net_ctx!(self);
                match self.links.find_link_mut(link_id) {
                    Some(link) => link.on_readable(&mut ctx),
                    None => return,
                }
            };
            // Deliver what decoded before any error tears the link down.
            self.post_link_effects(link_id);
            if let Err(err) = res {
                self.close_link_inner(link_id, err.code());
                return;
            }
        }

        if event.is_writable() {
            let res = {
                let mut ctx = net_ctx!(self);
                match self.links.find_link_mut(link_id) {
                    Some(link) => link.on_writable(&mut ctx),
                    None => return,
                }
            };
            if let Err(err) = res {
                self.close_link_inner(link_id, err.code());
            }
        }
    }

    fn handle_accept(&mut self, slot: usize) {
        loop {
            let accepted = match self.listeners.get_mut(slot).and_then(Option::as_mut) {
                Some(entry) => (entry.listener.accept(), entry.link_type, entry.group_id),
                None => return,
            };
            match accepted {
                (Ok((stream, addr)), link_type, group_id) => {
                    self.accept_stream(link_type, group_id, stream, addr);
                }
                (Err(ref err), _, _) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                (Err(err), _, group_id) => {
                    tracing::error!(group_id, ?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn accept_stream(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        stream: TcpStream,
        addr: SocketAddr,
    ) {
        let Some(mut link) = LinkFactory::get(link_type) else {
            tracing::error!(link_type, "no link variant for accepted stream");
            return;
        };
        {
            let mut ctx = net_ctx!(self);
            link.init(&mut ctx);
        }
        let link_id = match self.links.add_link(link, group_id, true) {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(group_id, code = err.code(), "link registration failed");
                return;
            }
        };
        let attached = {
            let mut ctx = net_ctx!(self);
            match self.links.find_link_mut(link_id) {
                Some(link) => link.attach_stream(&mut ctx, stream, addr, Interest::READABLE),
                None => Err(NetError::NotFoundLink),
            }
        };
        if let Err(err) = attached {
            tracing::error!(link_id, code = err.code(), "stream attach failed");
            self.discard_link(link_id);
            return;
        }
        self.open_link(link_id);
    }

    /// Opening → Open: fire the open event, arm keepalive, run the
    /// pipeline's start pass.
    fn open_link(&mut self, link_id: LinkId) {
        let Some(addr) = ({
            let mut ctx = net_ctx!(self);
            self.links.find_link_mut(link_id).map(|link| {
                link.on_open(&mut ctx);
                link.peer_addr().unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)))
            })
        }) else {
            return;
        };
        let group_id = self.links.find_link(link_id).map(|l| l.group_id()).unwrap_or(0);

        self.event_link_open.notify(&mut LinkOpenArgs { group_id, link_id, addr });

        let keepalive = self.config.keepalive_ms;
        if keepalive > 0 {
            let timer_id = self.timer.add(keepalive, keepalive, -1, TimerEvent::KeepAlive(link_id));
            if let Some(link) = self.links.find_link_mut(link_id) {
                link.core.set_alive_timer(timer_id);
            }
        }

        let started = {
            let mut ctx = net_ctx!(self);
            match self.links.find_link_mut(link_id) {
                Some(link) => link.start(&mut ctx),
                None => return,
            }
        };
        self.post_link_effects(link_id);
        if let Err(err) = started {
            self.close_link_inner(link_id, err.code());
        }
    }

    /// Collects what a pipeline entry staged on the link: start/msg events,
    /// the flush mark, and any close request.
    fn post_link_effects(&mut self, link_id: LinkId) {
        let Some(link) = self.links.find_link_mut(link_id) else {
            return;
        };
        let group_id = link.group_id();
        let started = link.core.take_started();
        let msgs = link.core.take_inbox();
        let needs_flush = link.core.take_needs_flush();
        let close_request = link.core.take_close_request();

        if needs_flush {
            self.links.need_flush(link_id);
        }
        if started {
            self.event_link_start.notify(&mut LinkStartArgs { group_id, link_id });
        }
        for msg in msgs {
            self.event_link_msg.notify(&mut LinkMsgArgs { group_id, link_id, msg: Some(msg) });
        }
        if let Some(reason) = close_request {
            self.close_link_inner(link_id, reason);
        }
    }

    fn check_keepalive(&mut self, timer_id: i64, link_id: LinkId) {
        let dead = match self.links.find_link_mut(link_id) {
            Some(link) => {
                if link.core.is_alive(steady_ms(), self.config.keepalive_ms) {
                    false
                } else {
                    link.core.set_alive_timer(0);
                    true
                }
            }
            None => true,
        };
        if dead {
            self.timer.cancel(timer_id);
            self.close_link_inner(link_id, NetError::KeepAliveTimeout.code());
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.release();
    }
}

#[inline]
fn listener_token(slot: usize) -> Token {
    Token((slot << 1) | 1)
}
