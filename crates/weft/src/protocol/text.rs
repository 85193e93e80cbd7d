use weft_codec::{ByteWindow, MsgBuffer};

use crate::{
    error::{NetError, NetResult},
    msg::{BodyFlag, MsgPtr, NetMsg},
    protocol::{Pipeline, Protocol},
};

const DELIMITER: u8 = b'\n';

/// Newline-delimited text frames. Each inbound line becomes one message
/// with `BodyFlag::Text`; a trailing `\r` is stripped. Outbound messages
/// are the body plus the delimiter.
pub struct TextProtocol {
    reading: Option<MsgPtr>,
    scratch: MsgBuffer,
}

impl TextProtocol {
    pub fn new() -> Self {
        Self { reading: None, scratch: MsgBuffer::new() }
    }

    fn read_to_msg(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        while !win.is_empty() {
            if self.reading.is_none() {
                self.reading = Some(NetMsg::obtain());
            }
            let msg = self.reading.as_mut().ok_or(NetError::MemoryNotEnough)?;

            let rest = win.rest();
            match rest.iter().position(|&b| b == DELIMITER) {
                Some(at) => {
                    let line = &rest[..at];
                    let line = line.strip_suffix(b"\r").unwrap_or(line);
                    msg.write_body(line);
                    if msg.body().len() > p.ctx.config.msg_body_max {
                        return Err(NetError::MsgBodySizeMax);
                    }
                    msg.set_body_flag(BodyFlag::Text);
                    win.advance(at + 1);
                    let msg = self.reading.take().ok_or(NetError::MemoryNotEnough)?;
                    p.next_read_msg(msg)?;
                }
                None => {
                    msg.write_body(rest);
                    if msg.body().len() > p.ctx.config.msg_body_max {
                        return Err(NetError::MsgBodySizeMax);
                    }
                    let n = rest.len();
                    win.advance(n);
                }
            }
        }
        Ok(())
    }
}

impl Default for TextProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for TextProtocol {
    fn start(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.reading = None;
        p.next_start()
    }

    fn read(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        let res = self.read_to_msg(p, win);
        if res.is_err() {
            self.reading = None;
        }
        res
    }

    fn write_msg(&mut self, p: &mut Pipeline<'_, '_>, msg: &mut NetMsg) -> NetResult<()> {
        if msg.body_flag() != BodyFlag::Text {
            return Err(NetError::ProtocolDataInvalid);
        }
        self.scratch.clear();
        self.scratch.write(msg.body());
        self.scratch.push(DELIMITER);
        let total = self.scratch.size() as i64;
        let res = p.pre_write(self.scratch.data_mut(), 0, total);
        self.scratch.clear();
        res
    }

    fn end(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.reading = None;
        p.pre_end()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        link::LinkCore,
        protocol::{ProtocolStack, testkit::TestNet},
    };

    fn started_pair(net: &mut TestNet) -> (ProtocolStack, LinkCore) {
        let mut stack = ProtocolStack::new();
        stack.push_protocol(Box::new(TextProtocol::new())).unwrap();
        let mut core = {
            let mut ctx = net.ctx();
            LinkCore::test_open(ctx.buffers.get())
        };
        {
            let mut ctx = net.ctx();
            stack.on_start(&mut core, &mut ctx).unwrap();
        }
        (stack, core)
    }

    fn feed(net: &mut TestNet, stack: &mut ProtocolStack, core: &mut LinkCore, bytes: &[u8]) {
        let mut bytes = bytes.to_vec();
        let mut ctx = net.ctx();
        let mut win = weft_codec::ByteWindow::new(&mut bytes);
        stack.on_read(core, &mut ctx, &mut win).unwrap();
    }

    #[test]
    fn lines_become_text_messages() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);

        feed(&mut net, &mut stack, &mut core, b"first\r\nsec");
        feed(&mut net, &mut stack, &mut core, b"ond\nthird");

        let msgs = core.take_inbox();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].body(), b"first");
        assert_eq!(msgs[0].body_flag(), BodyFlag::Text);
        assert_eq!(msgs[1].body(), b"second");

        // The trailing partial line completes later.
        feed(&mut net, &mut stack, &mut core, b"\n");
        let msgs = core.take_inbox();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body(), b"third");
    }

    #[test]
    fn outbound_appends_delimiter_and_checks_flag() {
        let mut net = TestNet::new();
        let (mut stack, mut core) = started_pair(&mut net);

        let mut msg = NetMsg::obtain();
        msg.set_body_flag(BodyFlag::Text);
        msg.write_body(b"a line");
        {
            let mut ctx = net.ctx();
            stack.on_write(&mut core, &mut ctx, &mut msg).unwrap();
        }
        assert_eq!(core.test_writer_take(), b"a line\n");

        let mut wrong = NetMsg::obtain();
        wrong.set_body_flag(BodyFlag::Msg);
        wrong.write_body(b"binary");
        let res = {
            let mut ctx = net.ctx();
            stack.on_write(&mut core, &mut ctx, &mut wrong)
        };
        assert!(matches!(res, Err(NetError::ProtocolDataInvalid)));
    }
}
