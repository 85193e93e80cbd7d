use weft_utils::Event;

use crate::{
    BroadcastDest, GroupId, LinkId, LinkType,
    config::NetConfig,
    error::NetResult,
    msg::MsgPtr,
    reactor::{
        LinkCloseArgs, LinkEndArgs, LinkMsgArgs, LinkOpenArgs, LinkStartArgs, Reactor,
    },
};

/// The in-thread facade: the caller owns the loop cadence and drives
/// `update` itself; events fire during that call on the same thread.
pub struct NetProcess {
    reactor: Reactor,
}

impl NetProcess {
    pub fn start(config: NetConfig) -> NetResult<Self> {
        Ok(Self { reactor: Reactor::new(config)? })
    }

    pub fn stop(&mut self) {
        self.reactor.release();
    }

    pub fn update(&mut self, delta_ms: i64) {
        self.reactor.update(delta_ms);
    }

    pub fn listen_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        ip: &str,
        port: u16,
    ) -> NetResult<()> {
        self.reactor.listen_tcp(link_type, group_id, ip, port)
    }

    pub fn stop_listen_tcp(&mut self, group_id: GroupId) {
        self.reactor.stop_listen_tcp(group_id);
    }

    pub fn connect_tcp(
        &mut self,
        link_type: LinkType,
        group_id: GroupId,
        host: &str,
        port: u16,
        cb: impl FnOnce(i32, GroupId, LinkId) + 'static,
    ) {
        self.reactor.connect_tcp(link_type, group_id, host, port, cb);
    }

    pub fn close_link(&mut self, link_id: LinkId, reason: i32) {
        self.reactor.close_link(link_id, reason);
    }

    pub fn get_host_ip(&mut self, host: &str, cb: impl FnOnce(i32, &str) + 'static) {
        self.reactor.get_host_ip(host, cb);
    }

    /// Sends to the link stamped in the message.
    pub fn send_msg(&mut self, msg: MsgPtr) -> NetResult<()> {
        self.reactor.send_msg(msg)
    }

    /// One copy per (link, user) pair in `dest`.
    pub fn broadcast_msg(&mut self, dest: &BroadcastDest, msg: MsgPtr) -> NetResult<()> {
        self.reactor.broadcast_msg(dest, msg)
    }

    pub fn link_count(&self) -> usize {
        self.reactor.link_count()
    }

    pub fn event_link_open(&mut self) -> &mut Event<LinkOpenArgs> {
        &mut self.reactor.event_link_open
    }

    pub fn event_link_start(&mut self) -> &mut Event<LinkStartArgs> {
        &mut self.reactor.event_link_start
    }

    pub fn event_link_msg(&mut self) -> &mut Event<LinkMsgArgs> {
        &mut self.reactor.event_link_msg
    }

    pub fn event_link_end(&mut self) -> &mut Event<LinkEndArgs> {
        &mut self.reactor.event_link_end
    }

    pub fn event_link_close(&mut self) -> &mut Event<LinkCloseArgs> {
        &mut self.reactor.event_link_close
    }
}
