use std::{
    cell::RefCell,
    collections::BTreeMap,
    net::SocketAddr,
    rc::Rc,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use weft_codec::MsgBuffer;
use weft_timing::{SleepIdler, steady_ms};
use weft_utils::Event;

use crate::{
    BroadcastDest, GroupId, LinkId, LinkType,
    config::NetConfig,
    error::{NetError, NetResult, SUCCESS},
    link::mgr,
    msg::{MsgPtr, SendFlag},
    reactor::{
        LinkCloseArgs, LinkEndArgs, LinkMsgArgs, LinkOpenArgs, LinkStartArgs, Reactor,
    },
};

/// A lock-protected FIFO whose producers stage locally and hand over whole
/// batches, so the critical section is a vec swap.
pub(crate) struct SwapQueue<T> {
    inner: Mutex<Vec<T>>,
}

impl<T> SwapQueue<T> {
    fn new() -> Self {
        Self { inner: Mutex::new(Vec::new()) }
    }

    /// Publishes every staged item, leaving `staged` empty.
    pub(crate) fn push_all(&self, staged: &mut Vec<T>) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if queue.is_empty() {
            std::mem::swap(&mut *queue, staged);
        } else {
            queue.append(staged);
        }
    }

    /// Takes everything queued, appending to `out`.
    pub(crate) fn take_into(&self, out: &mut Vec<T>) {
        let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if out.is_empty() {
            std::mem::swap(&mut *queue, out);
        } else {
            out.append(&mut queue);
        }
    }
}

/// Logic → reactor.
enum NetRequest {
    Listen { req_id: i64, link_type: LinkType, group_id: GroupId, ip: String, port: u16 },
    StopListen { group_id: GroupId },
    Connect { req_id: i64, link_type: LinkType, group_id: GroupId, host: String, port: u16 },
    GetHostIp { req_id: i64, host: String },
    CloseLink { link_id: LinkId, reason: i32 },
    SendMsg { msg: MsgPtr },
}

/// Reactor → logic: replies for tracked requests plus the unsolicited link
/// lifecycle stream.
enum NetResponse {
    Resp { req_id: i64, payload: RespPayload },
    LinkOpen { group_id: GroupId, link_id: LinkId, addr: SocketAddr },
    LinkStart { group_id: GroupId, link_id: LinkId },
    LinkMsg { group_id: GroupId, link_id: LinkId, msg: MsgPtr },
    LinkEnd { group_id: GroupId, link_id: LinkId, reason: i32 },
    LinkClose { group_id: GroupId, link_id: LinkId, reason: i32 },
}

enum RespPayload {
    Listen { err: i32, group_id: GroupId },
    Connect { err: i32, group_id: GroupId, link_id: LinkId },
    HostIp { err: i32, ip: String },
}

enum Continuation {
    Listen(Box<dyn FnOnce(i32, GroupId)>),
    Connect(Box<dyn FnOnce(i32, GroupId, LinkId)>),
    HostIp(Box<dyn FnOnce(i32, String)>),
}

impl Continuation {
    fn run(self, payload: RespPayload) {
        match (self, payload) {
            (Continuation::Listen(cb), RespPayload::Listen { err, group_id }) => cb(err, group_id),
            (Continuation::Connect(cb), RespPayload::Connect { err, group_id, link_id }) => {
                cb(err, group_id, link_id);
            }
            (Continuation::HostIp(cb), RespPayload::HostIp { err, ip }) => cb(err, ip),
            _ => tracing::error!("response payload mismatched the tracked request"),
        }
    }
}

struct PendingReq {
    req_time: i64,
    cont: Continuation,
}

struct Shared {
    running: AtomicBool,
    req_q: SwapQueue<NetRequest>,
    resp_q: SwapQueue<NetResponse>,
}

/// Hosts a reactor on its own OS thread.
///
/// The boundary is two swap queues: requests flow in, replies and link
/// events flow out, each object freed by the thread that dequeues it.
/// Requests expecting a reply are parked with a deadline; `update` sweeps
/// the park and drops the stale ones, and a reply arriving after its
/// request expired is logged and discarded.
pub struct NetThread {
    config: NetConfig,
    req_timeout_ms: i64,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    req_staging: Vec<NetRequest>,
    resp_scratch: Vec<NetResponse>,
    req_gen: i64,
    waiting: BTreeMap<i64, PendingReq>,

    pub event_link_open: Event<LinkOpenArgs>,
    pub event_link_start: Event<LinkStartArgs>,
    pub event_link_msg: Event<LinkMsgArgs>,
    pub event_link_end: Event<LinkEndArgs>,
    pub event_link_close: Event<LinkCloseArgs>,
}

impl NetThread {
    pub fn new(config: NetConfig) -> Self {
        let req_timeout_ms = config.req_timeout_ms;
        Self {
            config,
            req_timeout_ms,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                req_q: SwapQueue::new(),
                resp_q: SwapQueue::new(),
            }),
            worker: None,
            req_staging: Vec::new(),
            resp_scratch: Vec::new(),
            req_gen: 0,
            waiting: BTreeMap::new(),
            event_link_open: Event::new(),
            event_link_start: Event::new(),
            event_link_msg: Event::new(),
            event_link_end: Event::new(),
            event_link_close: Event::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn req_timeout_ms(&self) -> i64 {
        self.req_timeout_ms
    }

    /// Spawns the worker; the request timeout comes from the config.
    pub fn start(&mut self) -> NetResult<()> {
        if self.req_timeout_ms <= 0 {
            return Err(NetError::InvalidArg);
        }
        if self.is_running() {
            return Err(NetError::StateError);
        }
        self.shared.running.store(true, Ordering::Relaxed);
        let shared = self.shared.clone();
        let config = self.config.clone();
        let worker = std::thread::Builder::new()
            .name("weft-net".into())
            .spawn(move || run_worker(&shared, config))
            .map_err(NetError::Io)?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Joins the worker and frees everything in flight; no callback fires
    /// after this returns.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.event_link_open.clear();
        self.event_link_start.clear();
        self.event_link_msg.clear();
        self.event_link_end.clear();
        self.event_link_close.clear();
        self.waiting.clear();
        self.req_staging.clear();
        let mut junk = Vec::new();
        self.shared.req_q.take_into(&mut junk);
        drop(junk);
        let mut junk = Vec::new();
        self.shared.resp_q.take_into(&mut junk);
        drop(junk);
    }

    /// Logic-side pump: deliver responses, publish staged requests, sweep
    /// expired requests.
    pub fn update(&mut self) {
        self.logic_resp();
        self.logic_req();
        let deadline = steady_ms() - self.req_timeout_ms;
        while let Some((&req_id, pending)) = self.waiting.first_key_value() {
            if pending.req_time >= deadline {
                break;
            }
            tracing::warn!(req_id, "request timed out waiting for a response");
            self.waiting.pop_first();
        }
    }

    pub fn listen_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        ip: &str,
        port: u16,
        cb: impl FnOnce(i32, GroupId) + 'static,
    ) {
        let req_id = self.park(Continuation::Listen(Box::new(cb)));
        self.req_staging
            .push(NetRequest::Listen { req_id, link_type, group_id, ip: ip.to_string(), port });
    }

    pub fn stop_listen_tcp(&mut self, group_id: GroupId) {
        self.req_staging.push(NetRequest::StopListen { group_id });
    }

    pub fn connect_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        host: &str,
        port: u16,
        cb: impl FnOnce(i32, GroupId, LinkId) + 'static,
    ) {
        let req_id = self.park(Continuation::Connect(Box::new(cb)));
        self.req_staging
            .push(NetRequest::Connect { req_id, link_type, group_id, host: host.to_string(), port });
    }

    pub fn get_host_ip(&mut self, host: &str, cb: impl FnOnce(i32, String) + 'static) {
        let req_id = self.park(Continuation::HostIp(Box::new(cb)));
        self.req_staging.push(NetRequest::GetHostIp { req_id, host: host.to_string() });
    }

    pub fn close_link(&mut self, link_id: LinkId, reason: i32) {
        self.req_staging.push(NetRequest::CloseLink { link_id, reason });
    }

    pub fn send_msg(&mut self, mut msg: MsgPtr) {
        msg.set_send_flag(SendFlag::Single);
        self.req_staging.push(NetRequest::SendMsg { msg });
    }

    /// Packs the fan-out map in front of the body; the reactor side decodes
    /// it and re-dispatches one copy per (link, user) pair.
    pub fn broadcast_msg(&mut self, dest: &BroadcastDest, mut msg: MsgPtr) {
        msg.set_send_flag(SendFlag::Multi);
        let mut buf = MsgBuffer::new();
        mgr::encode_broadcast_dest(dest, &mut buf);
        buf.write(msg.body());
        msg.replace_buffer(buf);
        self.req_staging.push(NetRequest::SendMsg { msg });
    }

    fn park(&mut self, cont: Continuation) -> i64 {
        self.req_gen += 1;
        let req_id = self.req_gen;
        self.waiting.insert(req_id, PendingReq { req_time: steady_ms(), cont });
        req_id
    }

    fn logic_req(&mut self) {
        if self.req_staging.is_empty() {
            return;
        }
        self.shared.req_q.push_all(&mut self.req_staging);
    }

    fn logic_resp(&mut self) {
        let mut resps = std::mem::take(&mut self.resp_scratch);
        self.shared.resp_q.take_into(&mut resps);
        for resp in resps.drain(..) {
            self.dispatch_resp(resp);
        }
        self.resp_scratch = resps;
    }

    fn dispatch_resp(&mut self, resp: NetResponse) {
        match resp {
            NetResponse::Resp { req_id, payload } => match self.waiting.remove(&req_id) {
                Some(pending) => pending.cont.run(payload),
                None => {
                    tracing::error!(req_id, "response for unknown request, maybe it timed out");
                }
            },
            NetResponse::LinkOpen { group_id, link_id, addr } => {
                self.event_link_open.notify(&mut LinkOpenArgs { group_id, link_id, addr });
            }
            NetResponse::LinkStart { group_id, link_id } => {
                self.event_link_start.notify(&mut LinkStartArgs { group_id, link_id });
            }
            NetResponse::LinkMsg { group_id, link_id, msg } => {
                self.event_link_msg
                    .notify(&mut LinkMsgArgs { group_id, link_id, msg: Some(msg) });
            }
            NetResponse::LinkEnd { group_id, link_id, reason } => {
                self.event_link_end.notify(&mut LinkEndArgs { group_id, link_id, reason });
            }
            NetResponse::LinkClose { group_id, link_id, reason } => {
                self.event_link_close.notify(&mut LinkCloseArgs { group_id, link_id, reason });
            }
        }
    }
}

impl Drop for NetThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The reactor-side loop: drain requests, advance the reactor with a 1 ms
/// delta floor, publish responses, and sleep a little when idle.
fn run_worker(shared: &Arc<Shared>, config: NetConfig) {
    let mut reactor = match Reactor::new(config) {
        Ok(reactor) => reactor,
        Err(err) => {
            tracing::error!(code = err.code(), "reactor init failed");
            shared.running.store(false, Ordering::Relaxed);
            return;
        }
    };

    let staged: Rc<RefCell<Vec<NetResponse>>> = Rc::new(RefCell::new(Vec::new()));
    bind_events(&mut reactor, &staged);

    let mut idler = SleepIdler::new(10);
    let mut reqs = Vec::new();
    while shared.running.load(Ordering::Relaxed) {
        shared.req_q.take_into(&mut reqs);
        let had_work = !reqs.is_empty();
        for req in reqs.drain(..) {
            handle_request(&mut reactor, &staged, req);
        }

        let delta = idler.frame_check(1);
        if delta > 0 {
            reactor.update(delta);
        }

        let produced = {
            let mut staged = staged.borrow_mut();
            let produced = !staged.is_empty();
            if produced {
                shared.resp_q.push_all(&mut staged);
            }
            produced
        };
        idler.idle(had_work || produced);
    }

    reactor.release();
    let mut staged = staged.borrow_mut();
    if !staged.is_empty() {
        shared.resp_q.push_all(&mut staged);
    }
}

fn bind_events(reactor: &mut Reactor, staged: &Rc<RefCell<Vec<NetResponse>>>) {
    let s = staged.clone();
    reactor.event_link_open.bind(move |args: &mut LinkOpenArgs| {
        s.borrow_mut().push(NetResponse::LinkOpen {
            group_id: args.group_id,
            link_id: args.link_id,
            addr: args.addr,
        });
        true
    });
    let s = staged.clone();
    reactor.event_link_start.bind(move |args: &mut LinkStartArgs| {
        s.borrow_mut().push(NetResponse::LinkStart {
            group_id: args.group_id,
            link_id: args.link_id,
        });
        true
    });
    let s = staged.clone();
    reactor.event_link_msg.bind(move |args: &mut LinkMsgArgs| {
        if let Some(msg) = args.msg.take() {
            s.borrow_mut().push(NetResponse::LinkMsg {
                group_id: args.group_id,
                link_id: args.link_id,
                msg,
            });
        }
        true
    });
    let s = staged.clone();
    reactor.event_link_end.bind(move |args: &mut LinkEndArgs| {
        s.borrow_mut().push(NetResponse::LinkEnd {
            group_id: args.group_id,
            link_id: args.link_id,
            reason: args.reason,
        });
        true
    });
    let s = staged.clone();
    reactor.event_link_close.bind(move |args: &mut LinkCloseArgs| {
        s.borrow_mut().push(NetResponse::LinkClose {
            group_id: args.group_id,
            link_id: args.link_id,
            reason: args.reason,
        });
        true
    });
}

fn handle_request(reactor: &mut Reactor, staged: &Rc<RefCell<Vec<NetResponse>>>, req: NetRequest) {
    match req {
        NetRequest::Listen { req_id, link_type, group_id, ip, port } => {
            let err = match reactor.listen_tcp(link_type, group_id, &ip, port) {
                Ok(()) => SUCCESS,
                Err(err) => err.code(),
            };
            staged
                .borrow_mut()
                .push(NetResponse::Resp { req_id, payload: RespPayload::Listen { err, group_id } });
        }
        NetRequest::StopListen { group_id } => reactor.stop_listen_tcp(group_id),
        NetRequest::Connect { req_id, link_type, group_id, host, port } => {
            let s = staged.clone();
            reactor.connect_tcp(link_type, group_id, &host, port, move |err, group_id, link_id| {
                s.borrow_mut().push(NetResponse::Resp {
                    req_id,
                    payload: RespPayload::Connect { err, group_id, link_id },
                });
            });
        }
        NetRequest::GetHostIp { req_id, host } => {
            let s = staged.clone();
            reactor.get_host_ip(&host, move |err, ip| {
                s.borrow_mut().push(NetResponse::Resp {
                    req_id,
                    payload: RespPayload::HostIp { err, ip: ip.to_string() },
                });
            });
        }
        NetRequest::CloseLink { link_id, reason } => reactor.close_link(link_id, reason),
        NetRequest::SendMsg { msg } => {
            if let Err(err) = reactor.auto_send_msg(msg) {
                tracing::error!(code = err.code(), "queued send failed");
            }
        }
    }
}
