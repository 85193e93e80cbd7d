//! Self-describing binary codec and byte buffers.
//!
//! The wire format is the MessagePack layout restricted to the shapes the
//! networking core exchanges: unsigned and signed integers, raw binary,
//! strings, maps and arrays. Values carry their own type tag, so a reader
//! can both validate and size a value from the leading bytes; the framed
//! message protocol relies on this to read a length prefix of 1 to 5 bytes.

mod buffer;
mod decode;
mod encode;
mod error;

pub use buffer::{ByteWindow, MsgBuffer};
pub use decode::{read_array_head, read_bin, read_int, read_map_head, read_str, read_uint};
pub use encode::{write_array_head, write_bin, write_int, write_map_head, write_str, write_uint};
pub use error::CodecError;

pub type CodecResult<T> = Result<T, CodecError>;
