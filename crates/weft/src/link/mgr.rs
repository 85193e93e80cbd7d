use std::collections::HashMap;

use indexmap::IndexSet;
use weft_codec::{MsgBuffer, read_array_head, read_int, read_map_head, write_array_head, write_int,
    write_map_head};

use crate::{
    BroadcastDest, GroupId, LinkId,
    ctx::NetCtx,
    error::{NetError, NetResult},
    link::Link,
    msg::{MsgPtr, NetMsg, SendFlag},
};

/// The per-reactor link registry: assigns LinkIDs from a monotonic
/// counter, tracks which links still owe the kernel bytes, and routes
/// outbound messages by their send flag.
pub struct LinkMgr {
    links: HashMap<LinkId, Box<Link>>,
    need_flush: IndexSet<LinkId>,
    next_link_id: LinkId,
}

impl Default for LinkMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkMgr {
    pub fn new() -> Self {
        Self { links: HashMap::new(), need_flush: IndexSet::new(), next_link_id: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.links.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn link_ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    pub fn find_link(&self, link_id: LinkId) -> Option<&Link> {
        if link_id == 0 {
            return None;
        }
        self.links.get(&link_id).map(Box::as_ref)
    }

    pub fn find_link_mut(&mut self, link_id: LinkId) -> Option<&mut Box<Link>> {
        if link_id == 0 {
            return None;
        }
        self.links.get_mut(&link_id)
    }

    /// Registers a link under a fresh LinkID and stamps the identity into
    /// it. IDs are never reused within one registry.
    pub fn add_link(
        &mut self,
        mut link: Box<Link>,
        group_id: GroupId,
        is_server: bool,
    ) -> NetResult<LinkId> {
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        if self.links.contains_key(&link_id) {
            return Err(NetError::LinkIdInvalid);
        }
        link.reset_id(group_id, link_id, is_server);
        self.links.insert(link_id, link);
        Ok(link_id)
    }

    pub fn remove_link(&mut self, link_id: LinkId) -> Option<Box<Link>> {
        self.need_flush.swap_remove(&link_id);
        self.links.remove(&link_id)
    }

    /// Records the link for the next flush pass; pointless when nothing is
    /// staged.
    pub fn need_flush(&mut self, link_id: LinkId) {
        if self.links.contains_key(&link_id) {
            self.need_flush.insert(link_id);
        }
    }

    /// Flushes every recorded link, reporting the ones whose kernel write
    /// failed so the reactor can close them.
    pub fn flush_links(&mut self, ctx: &mut NetCtx<'_>) -> Vec<(LinkId, i32)> {
        let mut failed = Vec::new();
        let pending: Vec<LinkId> = self.need_flush.drain(..).collect();
        for link_id in pending {
            let Some(link) = self.links.get_mut(&link_id) else {
                continue;
            };
            if link.core.in_teardown() {
                continue;
            }
            if let Err(err) = link.flush(ctx) {
                tracing::warn!(link_id, code = err.code(), "flush failed");
                failed.push((link_id, err.code()));
            }
        }
        failed
    }

    /// Dispatches on the send flag: `Single` targets the stamped link,
    /// `Multi` decodes the leading destination map and fans out one copy
    /// per (link, user) pair.
    pub fn auto_send_msg(&mut self, ctx: &mut NetCtx<'_>, mut msg: MsgPtr) -> NetResult<()> {
        match msg.send_flag() {
            SendFlag::Single => self.send_msg(ctx, &mut msg),
            SendFlag::Multi => {
                let dest = decode_broadcast_dest(msg.buffer_mut())
                    .map_err(|_| NetError::UnpackMsgFailed)?;
                self.broadcast_msg(ctx, &dest, &mut msg);
                Ok(())
            }
            _ => Err(NetError::InvalidArg),
        }
    }

    pub fn send_msg(&mut self, ctx: &mut NetCtx<'_>, msg: &mut NetMsg) -> NetResult<()> {
        let link_id = msg.link_id();
        if link_id == 0 {
            // The reserved "none" id: the message was never aimed anywhere.
            return Err(NetError::NullPointer);
        }
        let Some(link) = self.links.get_mut(&link_id) else {
            return Err(NetError::NotFoundLink);
        };
        let res = link.send_msg(ctx, msg);
        if link.core.take_needs_flush() {
            self.need_flush.insert(link_id);
        }
        res
    }

    /// One attempt per (link, user) pair; failures are logged and the rest
    /// of the fan-out continues.
    pub fn broadcast_msg(&mut self, ctx: &mut NetCtx<'_>, dest: &BroadcastDest, msg: &mut NetMsg) {
        for (&link_id, users) in dest {
            for &user_id in users {
                msg.set_link_id(link_id);
                msg.set_user_id(user_id);
                if let Err(err) = self.send_msg(ctx, msg) {
                    tracing::error!(link_id, user_id, code = err.code(), "broadcast send failed");
                }
            }
        }
    }
}

/// Packs the fan-out map in front of a message body so the multi-send can
/// cross the thread boundary inside the message itself.
pub(crate) fn encode_broadcast_dest(dest: &BroadcastDest, out: &mut MsgBuffer) {
    write_map_head(out, dest.len());
    for (&link_id, users) in dest {
        write_int(out, link_id);
        write_array_head(out, users.len());
        for &user_id in users {
            write_int(out, user_id);
        }
    }
}

pub(crate) fn decode_broadcast_dest(input: &mut MsgBuffer) -> NetResult<BroadcastDest> {
    let mut dest = BroadcastDest::new();
    let entries = read_map_head(input)?;
    for _ in 0..entries {
        let link_id = read_int(input)?;
        let users = read_array_head(input)?;
        let set = dest.entry(link_id).or_default();
        for _ in 0..users {
            set.insert(read_int(input)?);
        }
    }
    Ok(dest)
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::protocol::testkit::TestNet;

    #[test]
    fn send_distinguishes_untargeted_from_unknown() {
        let mut net = TestNet::new();
        let mut mgr = LinkMgr::new();

        let mut msg = NetMsg::obtain();
        let res = {
            let mut ctx = net.ctx();
            mgr.send_msg(&mut ctx, &mut msg)
        };
        assert!(matches!(res, Err(NetError::NullPointer)));

        msg.set_link_id(42);
        let res = {
            let mut ctx = net.ctx();
            mgr.send_msg(&mut ctx, &mut msg)
        };
        assert!(matches!(res, Err(NetError::NotFoundLink)));
    }

    #[test]
    fn broadcast_dest_roundtrip() {
        let mut dest = BroadcastDest::new();
        dest.insert(1, HashSet::from([7, 9]));
        dest.insert(2, HashSet::from([11]));

        let mut buf = MsgBuffer::new();
        encode_broadcast_dest(&dest, &mut buf);
        buf.write(b"body");

        let back = decode_broadcast_dest(&mut buf).unwrap();
        assert_eq!(back, dest);
        assert_eq!(buf.data(), b"body");
    }
}
