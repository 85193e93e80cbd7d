use weft_codec::{ByteWindow, CodecError, MsgBuffer, read_uint, write_uint};

use crate::{
    error::{NetError, NetResult},
    msg::{BodyFlag, HEAD_SIZE, MsgPtr, NetMsg, RouteFlag},
    protocol::{Pipeline, Protocol},
};

/// Longest self-describing encoding of a `u32` length prefix.
const VARINT_MAX: usize = 5;

/// The framed-message layer: `varint(len)` followed by `len` bytes of
/// header + optional route record + body.
///
/// Inbound bytes accumulate into a pending message until the frame is
/// complete, then the header is re-parsed (the check sentinel gates the
/// whole connection) and a body-only message travels up the chain. Excess
/// input stays in the window and the loop continues, so several messages
/// in one kernel read each surface individually.
pub struct MsgProtocol {
    reading: Option<MsgPtr>,
    need_size: u64,
    scratch: MsgBuffer,
    route_scratch: MsgBuffer,
}

impl MsgProtocol {
    pub fn new() -> Self {
        Self {
            reading: None,
            need_size: 0,
            scratch: MsgBuffer::new(),
            route_scratch: MsgBuffer::new(),
        }
    }

    fn read_to_msg(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        while !win.is_empty() {
            if self.reading.is_none() {
                self.reading = Some(NetMsg::obtain());
                self.need_size = 0;
            }
            let msg = self.reading.as_mut().ok_or(NetError::MemoryNotEnough)?;

            if self.need_size == 0 {
                // Feed the length prefix byte-wise until it decodes.
                loop {
                    match read_uint(msg.buffer_mut()) {
                        Ok(n) => {
                            if n < HEAD_SIZE as u64 {
                                return Err(NetError::ProtocolDataInvalid);
                            }
                            if n - HEAD_SIZE as u64 > p.ctx.config.msg_body_max as u64 {
                                return Err(NetError::MsgBodySizeMax);
                            }
                            self.need_size = n;
                            break;
                        }
                        Err(CodecError::ReadBuffer) => {
                            if win.is_empty() {
                                return Ok(());
                            }
                            if msg.buffer().written() >= VARINT_MAX {
                                return Err(NetError::ProtocolDataInvalid);
                            }
                            let byte = win.rest()[0];
                            msg.buffer_mut().push(byte);
                            win.advance(1);
                        }
                        Err(_) => return Err(NetError::ProtocolDataInvalid),
                    }
                }
            }

            // Accumulate exactly the frame's remaining bytes; overshoot
            // stays in the window for the next message.
            let have = msg.buffer().size() as u64;
            let want = (self.need_size - have).min(win.remaining() as u64) as usize;
            msg.buffer_mut().write(&win.rest()[..want]);
            win.advance(want);

            if msg.buffer().size() as u64 == self.need_size {
                let mut msg = self.reading.take().ok_or(NetError::MemoryNotEnough)?;
                self.need_size = 0;
                Self::finish_msg(&mut msg)?;
                p.next_read_msg(msg)?;
            } else {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Re-parses the header (and route record when packed) out of the
    /// accumulated frame, leaving only the body readable.
    fn finish_msg(msg: &mut MsgPtr) -> NetResult<()> {
        let mut head_buf = std::mem::take(msg.buffer_mut());
        let head_res = msg.unpack_head(&mut head_buf);
        msg.replace_buffer(head_buf);
        head_res?;
        if msg.route_flag() == RouteFlag::Pack {
            let mut buf = std::mem::take(msg.buffer_mut());
            let route_res = msg.unpack_route(&mut buf);
            msg.replace_buffer(buf);
            route_res?;
        }
        if msg.body_size() != msg.body().len() {
            return Err(NetError::ProtocolDataInvalid);
        }
        Ok(())
    }
}

impl Default for MsgProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for MsgProtocol {
    fn start(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.reading = None;
        self.need_size = 0;
        p.next_start()
    }

    fn read(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        let res = self.read_to_msg(p, win);
        if res.is_err() {
            self.reading = None;
            self.need_size = 0;
        }
        res
    }

    fn write_msg(&mut self, p: &mut Pipeline<'_, '_>, msg: &mut NetMsg) -> NetResult<()> {
        if msg.body_flag() != BodyFlag::Msg {
            return Err(NetError::ProtocolDataInvalid);
        }
        if msg.body().len() > p.ctx.config.msg_body_max {
            return Err(NetError::MsgBodySizeMax);
        }
        msg.set_body_size(msg.body().len());

        self.route_scratch.clear();
        if msg.route_flag() == RouteFlag::Pack {
            msg.pack_route(&mut self.route_scratch);
        }
        let frame_len = HEAD_SIZE + self.route_scratch.size() + msg.body().len();

        // One contiguous downstream write, so a framing layer beneath wraps
        // the whole message exactly once.
        self.scratch.clear();
        write_uint(&mut self.scratch, frame_len as u64);
        msg.pack_head(&mut self.scratch);
        self.scratch.write(self.route_scratch.data());
        self.scratch.write(msg.body());

        let total = self.scratch.size() as i64;
        let res = p.pre_write(self.scratch.data_mut(), 0, total);
        self.scratch.clear();
        res
    }

    fn end(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.reading = None;
        self.need_size = 0;
        p.pre_end()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        link::{LinkCore, LinkState},
        msg::SendFlag,
        protocol::{ProtocolStack, testkit::TestNet},
    };

    fn started_pair(net: &mut TestNet) -> (ProtocolStack, LinkCore) {
        let mut stack = ProtocolStack::new();
        stack.push_protocol(Box::new(MsgProtocol::new())).unwrap();
        let mut core = {
            let mut ctx = net.ctx();
            LinkCore::test_open(ctx.buffers.get())
        };
        {
            let mut ctx = net.ctx();
            stack.on_start(&mut core, &mut ctx).unwrap();
        }
        assert_eq!(core.state(), LinkState::Start);
        (stack, core)
    }

    fn wire_for(net: &mut TestNet, stack: &mut ProtocolStack, core: &mut LinkCore, body: &[u8]) -> Vec<u8> {
        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Msg);
        msg.set_route_flag(RouteFlag::NoPack);
        msg.set_send_flag(SendFlag::Single);
        msg.write_body(body);
        let mut ctx = net.ctx();
        stack.on_write(core, &mut ctx, &mut msg).unwrap();
        core.test_writer_take()
    }

    #[test]
    fn every_byte_split_yields_exactly_one_msg() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);
        let wire = wire_for(&mut net, &mut stack, &mut core, b"hello");

        for split in 0..=wire.len() {
            let (mut a, mut b) = (wire[..split].to_vec(), wire[split..].to_vec());
            {
                let mut ctx = net.ctx();
                let mut win = weft_codec::ByteWindow::new(&mut a);
                stack.on_read(&mut core, &mut ctx, &mut win).unwrap();
            }
            {
                let mut ctx = net.ctx();
                let mut win = weft_codec::ByteWindow::new(&mut b);
                stack.on_read(&mut core, &mut ctx, &mut win).unwrap();
            }
            let msgs = core.take_inbox();
            assert_eq!(msgs.len(), 1, "split at {split}");
            assert_eq!(msgs[0].body(), b"hello");
            assert!(msgs[0].check_msg_flag());
            assert_eq!(msgs[0].link_id(), 1);
        }
    }

    #[test]
    fn several_frames_in_one_window() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);
        let mut wire = Vec::new();
        for body in [b"one".as_slice(), b"two", b"three"] {
            wire.extend(wire_for(&mut net, &mut stack, &mut core, body));
        }

        let mut ctx = net.ctx();
        let mut win = weft_codec::ByteWindow::new(&mut wire);
        stack.on_read(&mut core, &mut ctx, &mut win).unwrap();
        drop(ctx);

        let msgs = core.take_inbox();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].body(), b"one");
        assert_eq!(msgs[1].body(), b"two");
        assert_eq!(msgs[2].body(), b"three");
    }

    #[test]
    fn route_record_travels_when_packed() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);

        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Msg);
        msg.set_route_flag(RouteFlag::Pack);
        msg.set_user_id(4242);
        msg.set_opcode_id(17);
        msg.set_src_route(5);
        msg.set_dst_route(6);
        msg.write_body(b"routed");
        {
            let mut ctx = net.ctx();
            stack.on_write(&mut core, &mut ctx, &mut msg).unwrap();
        }
        let mut wire = core.test_writer_take();

        {
            let mut ctx = net.ctx();
            let mut win = weft_codec::ByteWindow::new(&mut wire);
            stack.on_read(&mut core, &mut ctx, &mut win).unwrap();
        }
        let msgs = core.take_inbox();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body(), b"routed");
        assert_eq!(msgs[0].user_id(), 4242);
        assert_eq!(msgs[0].opcode_id(), 17);
        assert_eq!(msgs[0].src_route(), 5);
        assert_eq!(msgs[0].dst_route(), 6);
    }

    #[test]
    fn bad_sentinel_is_protocol_data_invalid() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);
        let mut wire = wire_for(&mut net, &mut stack, &mut core, b"hi");
        // The sentinel's high bytes sit at frame offsets 7..9 (after the
        // one-byte length prefix).
        let last = wire.len() - 1;
        wire[last - 2] ^= 0xff;

        let mut ctx = net.ctx();
        let mut win = weft_codec::ByteWindow::new(&mut wire);
        let res = stack.on_read(&mut core, &mut ctx, &mut win);
        assert!(matches!(res, Err(NetError::ProtocolDataInvalid)));
        drop(ctx);
        assert!(core.take_inbox().is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut net = TestNet::new();
        net.config.msg_body_max = 64;
        let (mut stack, mut core) = started_pair(&mut net);

        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Msg);
        msg.write_body(&[0u8; 65]);
        let res = {
            let mut ctx = net.ctx();
            stack.on_write(&mut core, &mut ctx, &mut msg)
        };
        assert!(matches!(res, Err(NetError::MsgBodySizeMax)));
    }

    #[test]
    fn wrong_body_flag_is_rejected_outbound() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);

        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Text);
        msg.write_body(b"nope");
        let res = {
            let mut ctx = net.ctx();
            stack.on_write(&mut core, &mut ctx, &mut msg)
        };
        assert!(matches!(res, Err(NetError::ProtocolDataInvalid)));
    }
}
