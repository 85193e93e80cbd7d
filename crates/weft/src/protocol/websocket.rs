use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use md5::Md5;
use sha1::{Digest, Sha1};
use weft_codec::{ByteWindow, MsgBuffer};
use weft_timing::steady_ms;

use crate::{
    error::{NetError, NetResult},
    protocol::{Pipeline, Protocol},
};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_URL: &str = "/chat";
const WS_PROTOCOL: &str = "chat";
const WS_VERSION: &str = "13";
const WS_ORIGIN: &str = "null";

/// Base header plus the longest extended length and the mask key.
const HEAD_MAX: usize = 14;
const MASK_SIZE: usize = 4;
/// An upgrade request larger than this is rejected outright.
const HANDSHAKE_MAX: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WsState {
    Invalid,
    Connected,
    Upgrade,
    HandshakeOk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum WsOpcode {
    Empty = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl WsOpcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(WsOpcode::Empty),
            0x1 => Some(WsOpcode::Text),
            0x2 => Some(WsOpcode::Binary),
            0x8 => Some(WsOpcode::Close),
            0x9 => Some(WsOpcode::Ping),
            0xa => Some(WsOpcode::Pong),
            _ => None,
        }
    }
}

/// Scratch state for one HTTP upgrade exchange; dropped as soon as the
/// handshake completes.
#[derive(Default)]
struct Handshake {
    raw: Vec<u8>,
    client_key: String,
    status_code: u16,
    headers: Vec<(String, String)>,
}

impl Handshake {
    fn find(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn check(&self, name: &str, value: &str) -> bool {
        self.find(name) == Some(value)
    }

    /// Pulls bytes off the window until the blank line; answers true once
    /// the full head has arrived.
    fn feed(&mut self, win: &mut ByteWindow<'_>) -> NetResult<bool> {
        while !win.is_empty() {
            if self.raw.len() >= HANDSHAKE_MAX {
                return Err(NetError::HttpParseFailed);
            }
            self.raw.push(win.rest()[0]);
            win.advance(1);
            if self.raw.ends_with(b"\r\n\r\n") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn parse_request(&mut self) -> NetResult<()> {
        let mut fields = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut fields);
        match req.parse(&self.raw) {
            Ok(httparse::Status::Complete(_)) => {
                let headers = Self::collect_headers(req.headers);
                self.headers = headers;
                Ok(())
            }
            _ => Err(NetError::HttpParseFailed),
        }
    }

    fn parse_response(&mut self) -> NetResult<()> {
        let mut fields = [httparse::EMPTY_HEADER; 32];
        let mut resp = httparse::Response::new(&mut fields);
        match resp.parse(&self.raw) {
            Ok(httparse::Status::Complete(_)) => {
                let headers = Self::collect_headers(resp.headers);
                self.status_code = resp.code.unwrap_or(0);
                self.headers = headers;
                Ok(())
            }
            _ => Err(NetError::HttpParseFailed),
        }
    }

    fn collect_headers(fields: &[httparse::Header<'_>]) -> Vec<(String, String)> {
        fields
            .iter()
            .filter_map(|h| {
                let value = str::from_utf8(h.value).ok()?;
                Some((h.name.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameStage {
    Header,
    Payload { skip: bool },
}

/// RFC 6455 over the byte-level chain: an HTTP upgrade handshake, then
/// masked binary frames.
///
/// As a server the layer answers the peer's upgrade with the accept key
/// and requires inbound data to be masked; as a client it synthesises the
/// request with a fresh key, verifies the accept echo, and masks outbound
/// payloads with a per-frame key from the reactor's RNG.
pub struct WebSocketProtocol {
    state: WsState,
    handshake: Option<Box<Handshake>>,

    stage: FrameStage,
    head_buf: Vec<u8>,
    fin: bool,
    opcode: WsOpcode,
    need_size: u64,
    mask: Option<[u8; 4]>,
    mask_idx: usize,

    scratch: MsgBuffer,
}

impl WebSocketProtocol {
    pub fn new() -> Self {
        Self {
            state: WsState::Invalid,
            handshake: None,
            stage: FrameStage::Header,
            head_buf: Vec::with_capacity(HEAD_MAX),
            fin: true,
            opcode: WsOpcode::Empty,
            need_size: 0,
            mask: None,
            mask_idx: 0,
            scratch: MsgBuffer::new(),
        }
    }

    pub fn is_handshake_ok(&self) -> bool {
        self.state == WsState::HandshakeOk
    }

    // --- handshake -------------------------------------------------------

    fn client_key(p: &mut Pipeline<'_, '_>) -> String {
        use rand::Rng;

        let seed = format!("{}|{}|{}", p.ctx.rng.random::<u32>(), std::process::id(), steady_ms());
        BASE64.encode(Md5::digest(seed.as_bytes()))
    }

    fn accept_key(client_key: &str) -> String {
        let mut joined = client_key.to_string();
        joined.push_str(WS_GUID);
        BASE64.encode(Sha1::digest(joined.as_bytes()))
    }

    fn send_upgrade_request(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        let key = Self::client_key(p);
        let http = format!(
            "GET {WS_URL} HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: {WS_ORIGIN}\r\n\
             Sec-WebSocket-Protocol: {WS_PROTOCOL}\r\n\
             Sec-WebSocket-Version: {WS_VERSION}\r\n\
             Sec-WebSocket-Key: {key}\r\n\r\n"
        );
        if let Some(hs) = self.handshake.as_mut() {
            hs.client_key = key;
        }
        self.scratch.clear();
        self.scratch.write(http.as_bytes());
        let total = self.scratch.size() as i64;
        let res = p.pre_write(self.scratch.data_mut(), 0, total);
        self.scratch.clear();
        res
    }

    fn read_handshake(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        let Some(hs) = self.handshake.as_mut() else {
            return Err(NetError::WsNotHandshake);
        };
        if !hs.feed(win)? {
            return Ok(());
        }
        if p.core.is_server() {
            hs.parse_request()?;
        } else {
            hs.parse_response()?;
        }
        self.upgrade(p)
    }

    fn upgrade(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        if self.state != WsState::Upgrade {
            return Err(NetError::WsHandshakeFailed);
        }
        let Some(hs) = self.handshake.as_ref() else {
            return Err(NetError::WsHandshakeFailed);
        };
        if !hs.check("Upgrade", "websocket")
            || !hs.check("Connection", "Upgrade")
            || !hs.check("Sec-WebSocket-Version", WS_VERSION)
        {
            return Err(NetError::WsHandshakeFailed);
        }

        if p.core.is_server() {
            let key = hs.find("Sec-WebSocket-Key").unwrap_or("");
            if key.is_empty() {
                return Err(NetError::WsHandshakeFailed);
            }
            let accept = Self::accept_key(key);
            let protocol = if hs.check("Sec-WebSocket-Protocol", WS_PROTOCOL) {
                format!("Sec-WebSocket-Protocol: {WS_PROTOCOL}\r\n")
            } else {
                String::new()
            };
            let http = format!(
                "HTTP/1.1 101 SWITCHING_PROTOCOLS\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 {protocol}\
                 Sec-WebSocket-Version: {WS_VERSION}\r\n\
                 Sec-WebSocket-Accept: {accept}\r\n\r\n"
            );
            self.scratch.clear();
            self.scratch.write(http.as_bytes());
            let total = self.scratch.size() as i64;
            let res = p.pre_write(self.scratch.data_mut(), 0, total);
            self.scratch.clear();
            res?;
            self.finish_handshake(p)
        } else {
            if hs.status_code != 101 {
                return Err(NetError::WsHandshakeFailed);
            }
            let accept = hs.find("Sec-WebSocket-Accept").unwrap_or("");
            if accept.is_empty() || hs.client_key.is_empty() {
                return Err(NetError::WsHandshakeFailed);
            }
            if accept != Self::accept_key(&hs.client_key) {
                return Err(NetError::WsHandshakeFailed);
            }
            self.finish_handshake(p)
        }
    }

    fn finish_handshake(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.state = WsState::HandshakeOk;
        self.handshake = None;
        p.next_start()
    }

    // --- frame codec -----------------------------------------------------

    /// Total header length once the base two bytes are known.
    fn head_len(base1: u8) -> usize {
        let mut len = 2;
        match base1 & 0x7f {
            126 => len += 2,
            127 => len += 8,
            _ => {}
        }
        if base1 & 0x80 != 0 {
            len += MASK_SIZE;
        }
        len
    }

    fn parse_head(&mut self) -> NetResult<()> {
        let b0 = self.head_buf[0];
        let b1 = self.head_buf[1];
        self.fin = b0 & 0x80 != 0;
        self.opcode =
            WsOpcode::from_bits(b0 & 0x0f).ok_or(NetError::ProtocolDataInvalid)?;
        let len7 = b1 & 0x7f;
        let mut at = 2;
        self.need_size = match len7 {
            126 => {
                let n = u16::from_be_bytes([self.head_buf[2], self.head_buf[3]]);
                at += 2;
                n as u64
            }
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.head_buf[2..10]);
                at += 8;
                u64::from_be_bytes(raw)
            }
            n => n as u64,
        };
        self.mask = if b1 & 0x80 != 0 {
            let mut key = [0u8; MASK_SIZE];
            key.copy_from_slice(&self.head_buf[at..at + MASK_SIZE]);
            Some(key)
        } else {
            None
        };
        self.mask_idx = 0;
        tracing::trace!(
            fin = self.fin,
            opcode = ?self.opcode,
            len = self.need_size,
            masked = self.mask.is_some(),
            "ws frame header"
        );
        Ok(())
    }

    fn read_frames(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        while !win.is_empty() {
            match self.stage {
                FrameStage::Header => {
                    // Base bytes first, then whatever the length and mask
                    // bits say is still owed.
                    let want = if self.head_buf.len() < 2 {
                        2 - self.head_buf.len()
                    } else {
                        Self::head_len(self.head_buf[1]) - self.head_buf.len()
                    };
                    if want > 0 {
                        let take = want.min(win.remaining());
                        self.head_buf.extend_from_slice(&win.rest()[..take]);
                        win.advance(take);
                    }
                    if self.head_buf.len() < 2
                        || self.head_buf.len() < Self::head_len(self.head_buf[1])
                    {
                        // More header bytes may still sit in the window.
                        continue;
                    }
                    self.parse_head()?;
                    self.head_buf.clear();
                    match self.opcode {
                        WsOpcode::Close => {
                            p.core.request_close(crate::error::SUCCESS);
                            return Ok(());
                        }
                        WsOpcode::Ping | WsOpcode::Pong | WsOpcode::Empty => {
                            self.stage = FrameStage::Payload { skip: true };
                        }
                        WsOpcode::Text | WsOpcode::Binary => {
                            if self.need_size > 0 {
                                if p.core.is_server() && self.mask.is_none() {
                                    return Err(NetError::ProtocolDataInvalid);
                                }
                                if !p.core.is_server() && self.mask.is_some() {
                                    return Err(NetError::ProtocolDataInvalid);
                                }
                            }
                            self.stage = FrameStage::Payload { skip: false };
                        }
                    }
                    if self.need_size == 0 {
                        self.stage = FrameStage::Header;
                    }
                }
                FrameStage::Payload { skip } => {
                    let chunk = (self.need_size.min(win.remaining() as u64)) as usize;
                    if skip {
                        win.advance(chunk);
                    } else {
                        {
                            let slice = &mut win.rest_mut()[..chunk];
                            if let Some(mask) = self.mask {
                                for byte in slice.iter_mut() {
                                    *byte ^= mask[self.mask_idx];
                                    self.mask_idx = (self.mask_idx + 1) & 0x3;
                                }
                            }
                            let mut sub = ByteWindow::new(slice);
                            p.next_read(&mut sub)?;
                        }
                        win.advance(chunk);
                    }
                    self.need_size -= chunk as u64;
                    if self.need_size == 0 {
                        self.stage = FrameStage::Header;
                    }
                }
            }
        }
        Ok(())
    }

    /// Frame header with `fin` set; lengths use the 7/16/64-bit ladder.
    fn build_head(out: &mut MsgBuffer, opcode: WsOpcode, mask: Option<[u8; 4]>, len: usize) {
        let mask_bit: u8 = if mask.is_some() { 0x80 } else { 0 };
        out.push(0x80 | opcode as u8);
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.write(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.write(&(len as u64).to_be_bytes());
        }
        if let Some(key) = mask {
            out.write(&key);
        }
    }
}

impl Default for WebSocketProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocol for WebSocketProtocol {
    fn start(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.state = WsState::Connected;
        self.stage = FrameStage::Header;
        self.head_buf.clear();
        self.need_size = 0;
        self.mask = None;
        self.handshake = Some(Box::default());
        if !p.core.is_server() {
            self.send_upgrade_request(p)?;
        }
        self.state = WsState::Upgrade;
        Ok(())
    }

    fn read(&mut self, p: &mut Pipeline<'_, '_>, win: &mut ByteWindow<'_>) -> NetResult<()> {
        if !self.is_handshake_ok() {
            self.read_handshake(p, win)?;
            if !self.is_handshake_ok() {
                return Ok(());
            }
        }
        self.read_frames(p, win)
    }

    fn write(
        &mut self,
        p: &mut Pipeline<'_, '_>,
        data: &mut [u8],
        _left: i64,
        total: i64,
    ) -> NetResult<()> {
        use rand::Rng;

        if !self.is_handshake_ok() {
            return Err(NetError::WsNotHandshake);
        }
        let mask: Option<[u8; 4]> =
            if p.core.is_server() { None } else { Some(p.ctx.rng.random::<u32>().to_le_bytes()) };

        self.scratch.clear();
        Self::build_head(&mut self.scratch, WsOpcode::Binary, mask, data.len());
        let head_len = self.scratch.size() as i64;
        let res = p.pre_write(self.scratch.data_mut(), 0, total + head_len);
        self.scratch.clear();
        res?;

        if let Some(key) = mask {
            let mut idx = 0;
            for byte in data.iter_mut() {
                *byte ^= key[idx];
                idx = (idx + 1) & 0x3;
            }
        }
        p.pre_write(data, 0, total + head_len)
    }

    fn end(&mut self, p: &mut Pipeline<'_, '_>) -> NetResult<()> {
        self.handshake = None;
        if self.is_handshake_ok() {
            self.scratch.clear();
            Self::build_head(&mut self.scratch, WsOpcode::Close, None, 0);
            let total = self.scratch.size() as i64;
            if let Err(err) = {
                let res = p.pre_write(self.scratch.data_mut(), 0, total);
                self.scratch.clear();
                res
            } {
                tracing::debug!(code = err.code(), "close frame not sent");
            }
        }
        self.state = WsState::Invalid;
        self.stage = FrameStage::Header;
        self.head_buf.clear();
        self.need_size = 0;
        self.mask = None;
        self.mask_idx = 0;
        p.pre_end()
    }
}
