use std::{
    cell::RefCell,
    ops::{Deref, DerefMut},
};

use weft_codec::{CodecError, MsgBuffer, read_int, read_uint, write_int, write_uint};
use weft_utils::{ObjectCache, Reuse};

use crate::{
    GroupId, LinkId, OpcodeId, RouteId, UserId,
    error::{NetError, NetResult},
};

/// Upper 16 bits of every valid flag word.
const MSG_CHECK_FLAG: u32 = 0xcdcd_0000;

pub const HEAD_SIZE: usize = 8;

macro_rules! sub_flag {
    ($name:ident, $mask:literal, { $($variant:ident = $value:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            Invalid = 0x0,
            $($variant = $value,)+
        }

        impl $name {
            pub const MASK: u32 = $mask;

            /// Classifies the sub-flag nibble of a full flag word.
            #[inline]
            pub fn calc(flag: u32) -> Self {
                match flag & Self::MASK {
                    $($value => Self::$variant,)+
                    _ => Self::Invalid,
                }
            }
        }
    };
}

sub_flag!(RouteFlag, 0x0000_000f, { Pack = 0x1, NoPack = 0x2 });
sub_flag!(BodyFlag, 0x0000_00f0, { Msg = 0x10, Text = 0x20 });
sub_flag!(SendFlag, 0x0000_0f00, { Single = 0x100, Multi = 0x200 });

/// The extra nibble is reserved; only `Invalid` exists today.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtraFlag {
    Invalid = 0x0,
}

impl ExtraFlag {
    pub const MASK: u32 = 0x0000_f000;

    #[inline]
    pub fn calc(_flag: u32) -> Self {
        ExtraFlag::Invalid
    }
}

/// The fixed 8-byte wire header: a 32-bit flag word and the body size.
///
/// On the wire the flag straddles the size field: bytes 0-1 carry the low
/// half of the flag, bytes 2-5 the little-endian size, bytes 6-7 the high
/// half of the flag. The layout is bit-exact and preserved as-is.
#[derive(Clone, Copy, Debug)]
struct MsgHead {
    flag: u32,
    size: u32,
}

impl MsgHead {
    fn new() -> Self {
        Self { flag: MSG_CHECK_FLAG, size: 0 }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    fn pack(&self, out: &mut MsgBuffer) {
        let f = self.flag.to_le_bytes();
        let s = self.size.to_le_bytes();
        out.write(&[f[0], f[1], s[0], s[1], s[2], s[3], f[2], f[3]]);
    }

    fn unpack(&mut self, input: &mut MsgBuffer) -> NetResult<()> {
        if input.size() < HEAD_SIZE {
            return Err(NetError::UnpackMsgFailed);
        }
        let b = input.data();
        let flag = u32::from_le_bytes([b[0], b[1], b[6], b[7]]);
        let size = u32::from_le_bytes([b[2], b[3], b[4], b[5]]);
        if flag & 0xffff_0000 != MSG_CHECK_FLAG {
            return Err(NetError::ProtocolDataInvalid);
        }
        input.advance(HEAD_SIZE);
        self.flag = flag;
        self.size = size;
        Ok(())
    }
}

/// The in-memory-only routing sub-record, serialized through the
/// self-describing codec when the route flag asks for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct MsgRoute {
    src_route: RouteId,
    dst_route: RouteId,
    user_id: UserId,
    opcode_id: OpcodeId,
}

impl MsgRoute {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn pack(&self, out: &mut MsgBuffer) {
        write_int(out, self.src_route);
        write_int(out, self.dst_route);
        write_int(out, self.user_id);
        write_uint(out, self.opcode_id as u64);
    }

    fn unpack(&mut self, input: &mut MsgBuffer) -> Result<(), CodecError> {
        self.src_route = read_int(input)?;
        self.dst_route = read_int(input)?;
        self.user_id = read_int(input)?;
        self.opcode_id = read_uint(input)? as OpcodeId;
        Ok(())
    }
}

/// The unit of application-level exchange: flag-tagged header, optional
/// route record, growable body buffer, and transient (group, link)
/// attribution stamped when the message is delivered upward or targeted
/// for send.
pub struct NetMsg {
    group_id: GroupId,
    link_id: LinkId,
    head: MsgHead,
    route: MsgRoute,
    buffer: MsgBuffer,
}

impl Default for NetMsg {
    fn default() -> Self {
        Self {
            group_id: 0,
            link_id: 0,
            head: MsgHead::new(),
            route: MsgRoute::default(),
            buffer: MsgBuffer::new(),
        }
    }
}

impl NetMsg {
    /// Pulls a message from the calling thread's pool.
    pub fn obtain() -> MsgPtr {
        MsgPtr(Some(MSG_POOL.with_borrow_mut(|pool| pool.get())))
    }

    pub fn clear(&mut self) {
        self.group_id = 0;
        self.link_id = 0;
        self.head.clear();
        self.route.clear();
        self.buffer.clear();
    }

    pub const fn head_size() -> usize {
        HEAD_SIZE
    }

    /// Writes the 8-byte interleaved header.
    pub fn pack_head(&self, out: &mut MsgBuffer) {
        self.head.pack(out);
    }

    /// Reads the 8-byte interleaved header, verifying the check sentinel.
    pub fn unpack_head(&mut self, input: &mut MsgBuffer) -> NetResult<()> {
        self.head.unpack(input)
    }

    #[inline]
    pub fn body_size(&self) -> usize {
        self.head.size as usize
    }

    #[inline]
    pub fn set_body_size(&mut self, s: usize) {
        self.head.size = s as u32;
    }

    #[inline]
    pub fn add_body_size(&mut self, s: usize) {
        self.head.size += s as u32;
    }

    #[inline]
    pub fn flag(&self) -> u32 {
        self.head.flag
    }

    #[inline]
    pub fn check_msg_flag(&self) -> bool {
        self.head.flag & 0xffff_0000 == MSG_CHECK_FLAG
    }

    #[inline]
    pub fn route_flag(&self) -> RouteFlag {
        RouteFlag::calc(self.head.flag)
    }

    /// Masks in the route nibble, leaving every other bit untouched.
    #[inline]
    pub fn set_route_flag(&mut self, flag: RouteFlag) {
        self.head.flag = (self.head.flag & !RouteFlag::MASK) | (flag as u32 & RouteFlag::MASK);
    }

    #[inline]
    pub fn body_flag(&self) -> BodyFlag {
        BodyFlag::calc(self.head.flag)
    }

    #[inline]
    pub fn set_body_flag(&mut self, flag: BodyFlag) {
        self.head.flag = (self.head.flag & !BodyFlag::MASK) | (flag as u32 & BodyFlag::MASK);
    }

    #[inline]
    pub fn send_flag(&self) -> SendFlag {
        SendFlag::calc(self.head.flag)
    }

    #[inline]
    pub fn set_send_flag(&mut self, flag: SendFlag) {
        self.head.flag = (self.head.flag & !SendFlag::MASK) | (flag as u32 & SendFlag::MASK);
    }

    #[inline]
    pub fn extra_flag(&self) -> ExtraFlag {
        ExtraFlag::calc(self.head.flag)
    }

    #[inline]
    pub fn set_extra_flag(&mut self, flag: ExtraFlag) {
        self.head.flag = (self.head.flag & !ExtraFlag::MASK) | (flag as u32 & ExtraFlag::MASK);
    }

    pub fn pack_route(&self, out: &mut MsgBuffer) {
        self.route.pack(out);
    }

    pub fn unpack_route(&mut self, input: &mut MsgBuffer) -> NetResult<()> {
        self.route.unpack(input).map_err(|_| NetError::UnpackMsgFailed)
    }

    #[inline]
    pub fn src_route(&self) -> RouteId {
        self.route.src_route
    }

    #[inline]
    pub fn set_src_route(&mut self, route_id: RouteId) {
        self.route.src_route = route_id;
    }

    #[inline]
    pub fn dst_route(&self) -> RouteId {
        self.route.dst_route
    }

    #[inline]
    pub fn set_dst_route(&mut self, route_id: RouteId) {
        self.route.dst_route = route_id;
    }

    #[inline]
    pub fn user_id(&self) -> UserId {
        self.route.user_id
    }

    #[inline]
    pub fn set_user_id(&mut self, user_id: UserId) {
        self.route.user_id = user_id;
    }

    #[inline]
    pub fn opcode_id(&self) -> OpcodeId {
        self.route.opcode_id
    }

    #[inline]
    pub fn set_opcode_id(&mut self, opcode_id: OpcodeId) {
        self.route.opcode_id = opcode_id;
    }

    #[inline]
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    #[inline]
    pub fn set_group_id(&mut self, group_id: GroupId) {
        self.group_id = group_id;
    }

    #[inline]
    pub fn link_id(&self) -> LinkId {
        self.link_id
    }

    #[inline]
    pub fn set_link_id(&mut self, link_id: LinkId) {
        self.link_id = link_id;
    }

    /// Unread body bytes.
    #[inline]
    pub fn body(&self) -> &[u8] {
        self.buffer.data()
    }

    /// Appends body bytes and keeps the header size in step.
    pub fn write_body(&mut self, bytes: &[u8]) {
        self.buffer.write(bytes);
        self.add_body_size(bytes.len());
    }

    #[inline]
    pub fn buffer(&self) -> &MsgBuffer {
        &self.buffer
    }

    #[inline]
    pub fn buffer_mut(&mut self) -> &mut MsgBuffer {
        &mut self.buffer
    }

    /// Swaps in a rebuilt buffer (the broadcast path prefixes the
    /// destination map this way).
    pub fn replace_buffer(&mut self, buffer: MsgBuffer) {
        self.buffer = buffer;
    }
}

impl Reuse for NetMsg {
    fn reset(&mut self) {
        self.clear();
    }
}

thread_local! {
    static MSG_POOL: RefCell<ObjectCache<NetMsg>> = RefCell::new(ObjectCache::new(256));
}

/// A move-only handle owning one pooled [`NetMsg`].
///
/// Ownership transfers on move; dropping the handle parks the message in
/// the dropping thread's pool, so a message handed across the reactor/logic
/// boundary is recycled by its consumer.
pub struct MsgPtr(Option<Box<NetMsg>>);

impl MsgPtr {
    /// Detaches the message from pooling entirely.
    pub fn into_inner(mut self) -> Box<NetMsg> {
        self.0.take().expect("message already taken")
    }
}

impl Deref for MsgPtr {
    type Target = NetMsg;

    #[inline]
    fn deref(&self) -> &NetMsg {
        self.0.as_ref().expect("message already taken")
    }
}

impl DerefMut for MsgPtr {
    #[inline]
    fn deref_mut(&mut self) -> &mut NetMsg {
        self.0.as_mut().expect("message already taken")
    }
}

impl Drop for MsgPtr {
    fn drop(&mut self) {
        if let Some(msg) = self.0.take() {
            MSG_POOL.with_borrow_mut(|pool| pool.put(msg));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn head_wire_layout_is_interleaved() {
        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Msg);
        msg.set_send_flag(SendFlag::Single);
        msg.set_body_size(0x0102_0304);

        let mut out = MsgBuffer::new();
        msg.pack_head(&mut out);
        let flag = msg.flag().to_le_bytes();
        assert_eq!(
            out.data(),
            &[flag[0], flag[1], 0x04, 0x03, 0x02, 0x01, flag[2], flag[3]]
        );
    }

    #[test]
    fn head_roundtrip() {
        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Msg);
        msg.set_route_flag(RouteFlag::NoPack);
        msg.set_body_size(77);

        let mut wire = MsgBuffer::new();
        msg.pack_head(&mut wire);

        let mut back = NetMsg::obtain();
        back.unpack_head(&mut wire).unwrap();
        assert_eq!(back.flag(), msg.flag());
        assert_eq!(back.body_size(), 77);
        assert!(back.check_msg_flag());
    }

    #[test]
    fn unpack_rejects_bad_sentinel() {
        let mut wire = MsgBuffer::new();
        wire.write(&[0x10, 0x00, 0, 0, 0, 0, 0xab, 0xab]);
        let mut msg = NetMsg::obtain();
        assert!(matches!(msg.unpack_head(&mut wire), Err(NetError::ProtocolDataInvalid)));
    }

    #[test]
    fn setters_touch_only_their_nibble() {
        let mut msg = NetMsg::obtain();
        msg.set_route_flag(RouteFlag::Pack);
        msg.set_body_flag(BodyFlag::Text);
        msg.set_send_flag(SendFlag::Multi);
        let before = msg.flag();

        msg.set_body_flag(BodyFlag::Msg);
        let after = msg.flag();
        assert_eq!(before & !BodyFlag::MASK, after & !BodyFlag::MASK);
        assert_eq!(msg.route_flag(), RouteFlag::Pack);
        assert_eq!(msg.send_flag(), SendFlag::Multi);
        assert!(msg.check_msg_flag());
    }

    #[test]
    fn route_roundtrip() {
        let mut msg = NetMsg::obtain();
        msg.set_src_route(0x0102_0304_0506);
        msg.set_dst_route(-9);
        msg.set_user_id(424_242);
        msg.set_opcode_id(7);

        let mut wire = MsgBuffer::new();
        msg.pack_route(&mut wire);

        let mut back = NetMsg::obtain();
        back.unpack_route(&mut wire).unwrap();
        assert_eq!(back.src_route(), msg.src_route());
        assert_eq!(back.dst_route(), -9);
        assert_eq!(back.user_id(), 424_242);
        assert_eq!(back.opcode_id(), 7);
    }

    #[test]
    fn pool_recycles_cleared_messages() {
        {
            let mut msg = NetMsg::obtain();
            msg.write_body(b"payload");
            msg.set_link_id(5);
        }
        let msg = NetMsg::obtain();
        assert_eq!(msg.body(), b"");
        assert_eq!(msg.link_id(), 0);
        assert!(msg.check_msg_flag());
    }

    #[test]
    fn write_body_tracks_size() {
        let mut msg = NetMsg::obtain();
        msg.write_body(b"he");
        msg.write_body(b"llo");
        assert_eq!(msg.body_size(), 5);
        assert_eq!(msg.body(), b"hello");
    }
}
