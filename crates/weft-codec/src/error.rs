use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes available. Streaming readers treat this as
    /// "wait for more data" and retry with the same read position.
    #[error("read past available data")]
    ReadBuffer,
    #[error("unexpected type tag {0:#04x}")]
    TypeMismatch(u8),
    #[error("value out of range for target type")]
    OutOfRange,
}
