use crate::{
    CodecError, CodecResult,
    buffer::MsgBuffer,
    encode::{
        ARRAY16, ARRAY32, BIN8, BIN16, BIN32, FIXARRAY, FIXMAP, FIXSTR, FIXUINT_MAX, INT8, INT16,
        INT32, INT64, MAP16, MAP32, STR8, STR16, STR32, UINT8, UINT16, UINT32, UINT64,
    },
};

/// Restores the read position when the closure fails, so a streaming caller
/// can retry once more bytes have arrived.
fn transact<T>(buf: &mut MsgBuffer, f: impl FnOnce(&mut MsgBuffer) -> CodecResult<T>) -> CodecResult<T> {
    let mark = buf.read_pos();
    let res = f(buf);
    if res.is_err() {
        buf.set_read_pos(mark);
    }
    res
}

fn take_byte(buf: &mut MsgBuffer) -> CodecResult<u8> {
    let b = *buf.data().first().ok_or(CodecError::ReadBuffer)?;
    buf.advance(1);
    Ok(b)
}

fn take<const N: usize>(buf: &mut MsgBuffer) -> CodecResult<[u8; N]> {
    if buf.size() < N {
        return Err(CodecError::ReadBuffer);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&buf.data()[..N]);
    buf.advance(N);
    Ok(out)
}

fn take_vec(buf: &mut MsgBuffer, n: usize) -> CodecResult<Vec<u8>> {
    if buf.size() < n {
        return Err(CodecError::ReadBuffer);
    }
    let out = buf.data()[..n].to_vec();
    buf.advance(n);
    Ok(out)
}

pub fn read_uint(buf: &mut MsgBuffer) -> CodecResult<u64> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        match tag {
            0..=FIXUINT_MAX => Ok(tag as u64),
            UINT8 => Ok(take_byte(buf)? as u64),
            UINT16 => Ok(u16::from_be_bytes(take(buf)?) as u64),
            UINT32 => Ok(u32::from_be_bytes(take(buf)?) as u64),
            UINT64 => Ok(u64::from_be_bytes(take(buf)?)),
            other => Err(CodecError::TypeMismatch(other)),
        }
    })
}

pub fn read_int(buf: &mut MsgBuffer) -> CodecResult<i64> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        match tag {
            0..=FIXUINT_MAX => Ok(tag as i64),
            0xe0..=0xff => Ok(tag as i8 as i64),
            UINT8 => Ok(take_byte(buf)? as i64),
            UINT16 => Ok(u16::from_be_bytes(take(buf)?) as i64),
            UINT32 => Ok(u32::from_be_bytes(take(buf)?) as i64),
            UINT64 => {
                let v = u64::from_be_bytes(take(buf)?);
                i64::try_from(v).map_err(|_| CodecError::OutOfRange)
            }
            INT8 => Ok(take_byte(buf)? as i8 as i64),
            INT16 => Ok(i16::from_be_bytes(take(buf)?) as i64),
            INT32 => Ok(i32::from_be_bytes(take(buf)?) as i64),
            INT64 => Ok(i64::from_be_bytes(take(buf)?)),
            other => Err(CodecError::TypeMismatch(other)),
        }
    })
}

pub fn read_bin(buf: &mut MsgBuffer) -> CodecResult<Vec<u8>> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        let len = match tag {
            BIN8 => take_byte(buf)? as usize,
            BIN16 => u16::from_be_bytes(take(buf)?) as usize,
            BIN32 => u32::from_be_bytes(take(buf)?) as usize,
            other => return Err(CodecError::TypeMismatch(other)),
        };
        take_vec(buf, len)
    })
}

pub fn read_str(buf: &mut MsgBuffer) -> CodecResult<String> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        let len = match tag {
            _ if tag & 0xe0 == FIXSTR => (tag & 0x1f) as usize,
            STR8 => take_byte(buf)? as usize,
            STR16 => u16::from_be_bytes(take(buf)?) as usize,
            STR32 => u32::from_be_bytes(take(buf)?) as usize,
            other => return Err(CodecError::TypeMismatch(other)),
        };
        let bytes = take_vec(buf, len)?;
        String::from_utf8(bytes).map_err(|_| CodecError::OutOfRange)
    })
}

pub fn read_map_head(buf: &mut MsgBuffer) -> CodecResult<usize> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        match tag {
            _ if tag & 0xf0 == FIXMAP => Ok((tag & 0x0f) as usize),
            MAP16 => Ok(u16::from_be_bytes(take(buf)?) as usize),
            MAP32 => Ok(u32::from_be_bytes(take(buf)?) as usize),
            other => Err(CodecError::TypeMismatch(other)),
        }
    })
}

pub fn read_array_head(buf: &mut MsgBuffer) -> CodecResult<usize> {
    transact(buf, |buf| {
        let tag = take_byte(buf)?;
        match tag {
            _ if tag & 0xf0 == FIXARRAY => Ok((tag & 0x0f) as usize),
            ARRAY16 => Ok(u16::from_be_bytes(take(buf)?) as usize),
            ARRAY32 => Ok(u32::from_be_bytes(take(buf)?) as usize),
            other => Err(CodecError::TypeMismatch(other)),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode::{
        write_array_head, write_bin, write_int, write_map_head, write_str, write_uint,
    };

    #[test]
    fn uint_roundtrip() {
        let cases = [0u64, 1, 0x7f, 0x80, 0xff, 0x100, 0xffff, 0x10000, u32::MAX as u64, u64::MAX];
        for v in cases {
            let mut buf = MsgBuffer::new();
            write_uint(&mut buf, v);
            assert_eq!(read_uint(&mut buf).unwrap(), v, "value {v:#x}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn uint_widths() {
        for (v, width) in [(5u64, 1usize), (200, 2), (40_000, 3), (70_000, 5), (1 << 40, 9)] {
            let mut buf = MsgBuffer::new();
            write_uint(&mut buf, v);
            assert_eq!(buf.size(), width, "value {v}");
        }
    }

    #[test]
    fn int_roundtrip() {
        let cases =
            [0i64, 1, -1, -32, -33, 127, 128, -128, -129, i16::MIN as i64, i32::MIN as i64, i64::MIN, i64::MAX];
        for v in cases {
            let mut buf = MsgBuffer::new();
            write_int(&mut buf, v);
            assert_eq!(read_int(&mut buf).unwrap(), v, "value {v}");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn str_and_bin_roundtrip() {
        let mut buf = MsgBuffer::new();
        write_str(&mut buf, "hello");
        write_bin(&mut buf, &[1, 2, 3]);
        write_str(&mut buf, &"x".repeat(300));
        assert_eq!(read_str(&mut buf).unwrap(), "hello");
        assert_eq!(read_bin(&mut buf).unwrap(), vec![1, 2, 3]);
        assert_eq!(read_str(&mut buf).unwrap().len(), 300);
    }

    #[test]
    fn container_heads() {
        let mut buf = MsgBuffer::new();
        write_map_head(&mut buf, 3);
        write_array_head(&mut buf, 20);
        write_map_head(&mut buf, 70_000);
        assert_eq!(read_map_head(&mut buf).unwrap(), 3);
        assert_eq!(read_array_head(&mut buf).unwrap(), 20);
        assert_eq!(read_map_head(&mut buf).unwrap(), 70_000);
    }

    #[test]
    fn short_read_keeps_position() {
        let mut full = MsgBuffer::new();
        write_uint(&mut full, 70_000);
        let encoded = full.data().to_vec();

        let mut buf = MsgBuffer::new();
        buf.write(&encoded[..2]);
        assert_eq!(read_uint(&mut buf), Err(CodecError::ReadBuffer));
        assert_eq!(buf.read_pos(), 0);

        buf.write(&encoded[2..]);
        assert_eq!(read_uint(&mut buf).unwrap(), 70_000);
    }

    #[test]
    fn type_mismatch_keeps_position() {
        let mut buf = MsgBuffer::new();
        write_str(&mut buf, "nope");
        assert!(matches!(read_uint(&mut buf), Err(CodecError::TypeMismatch(_))));
        assert_eq!(buf.read_pos(), 0);
        assert_eq!(read_str(&mut buf).unwrap(), "nope");
    }
}
