use crate::buffer::MsgBuffer;

// Format tags, MessagePack layout.
pub(crate) const FIXUINT_MAX: u8 = 0x7f;
pub(crate) const FIXMAP: u8 = 0x80;
pub(crate) const FIXARRAY: u8 = 0x90;
pub(crate) const FIXSTR: u8 = 0xa0;
pub(crate) const BIN8: u8 = 0xc4;
pub(crate) const BIN16: u8 = 0xc5;
pub(crate) const BIN32: u8 = 0xc6;
pub(crate) const UINT8: u8 = 0xcc;
pub(crate) const UINT16: u8 = 0xcd;
pub(crate) const UINT32: u8 = 0xce;
pub(crate) const UINT64: u8 = 0xcf;
pub(crate) const INT8: u8 = 0xd0;
pub(crate) const INT16: u8 = 0xd1;
pub(crate) const INT32: u8 = 0xd2;
pub(crate) const INT64: u8 = 0xd3;
pub(crate) const STR8: u8 = 0xd9;
pub(crate) const STR16: u8 = 0xda;
pub(crate) const STR32: u8 = 0xdb;
pub(crate) const ARRAY16: u8 = 0xdc;
pub(crate) const ARRAY32: u8 = 0xdd;
pub(crate) const MAP16: u8 = 0xde;
pub(crate) const MAP32: u8 = 0xdf;
pub(crate) const NEGFIXINT_MIN: i64 = -32;

/// Writes an unsigned integer in its shortest self-describing form
/// (1 to 9 bytes; values that fit a `u32` take at most 5).
pub fn write_uint(buf: &mut MsgBuffer, v: u64) {
    if v <= FIXUINT_MAX as u64 {
        buf.push(v as u8);
    } else if v <= u8::MAX as u64 {
        buf.push(UINT8);
        buf.push(v as u8);
    } else if v <= u16::MAX as u64 {
        buf.push(UINT16);
        buf.write(&(v as u16).to_be_bytes());
    } else if v <= u32::MAX as u64 {
        buf.push(UINT32);
        buf.write(&(v as u32).to_be_bytes());
    } else {
        buf.push(UINT64);
        buf.write(&v.to_be_bytes());
    }
}

/// Writes a signed integer; non-negative values use the unsigned forms.
pub fn write_int(buf: &mut MsgBuffer, v: i64) {
    if v >= 0 {
        write_uint(buf, v as u64);
    } else if v >= NEGFIXINT_MIN {
        buf.push(v as u8);
    } else if v >= i8::MIN as i64 {
        buf.push(INT8);
        buf.push(v as u8);
    } else if v >= i16::MIN as i64 {
        buf.push(INT16);
        buf.write(&(v as i16).to_be_bytes());
    } else if v >= i32::MIN as i64 {
        buf.push(INT32);
        buf.write(&(v as i32).to_be_bytes());
    } else {
        buf.push(INT64);
        buf.write(&v.to_be_bytes());
    }
}

pub fn write_bin(buf: &mut MsgBuffer, bytes: &[u8]) {
    let len = bytes.len();
    if len <= u8::MAX as usize {
        buf.push(BIN8);
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(BIN16);
        buf.write(&(len as u16).to_be_bytes());
    } else {
        buf.push(BIN32);
        buf.write(&(len as u32).to_be_bytes());
    }
    buf.write(bytes);
}

pub fn write_str(buf: &mut MsgBuffer, s: &str) {
    let len = s.len();
    if len <= 31 {
        buf.push(FIXSTR | len as u8);
    } else if len <= u8::MAX as usize {
        buf.push(STR8);
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(STR16);
        buf.write(&(len as u16).to_be_bytes());
    } else {
        buf.push(STR32);
        buf.write(&(len as u32).to_be_bytes());
    }
    buf.write(s.as_bytes());
}

pub fn write_map_head(buf: &mut MsgBuffer, entries: usize) {
    if entries <= 15 {
        buf.push(FIXMAP | entries as u8);
    } else if entries <= u16::MAX as usize {
        buf.push(MAP16);
        buf.write(&(entries as u16).to_be_bytes());
    } else {
        buf.push(MAP32);
        buf.write(&(entries as u32).to_be_bytes());
    }
}

pub fn write_array_head(buf: &mut MsgBuffer, entries: usize) {
    if entries <= 15 {
        buf.push(FIXARRAY | entries as u8);
    } else if entries <= u16::MAX as usize {
        buf.push(ARRAY16);
        buf.write(&(entries as u16).to_be_bytes());
    } else {
        buf.push(ARRAY32);
        buf.write(&(entries as u32).to_be_bytes());
    }
}
