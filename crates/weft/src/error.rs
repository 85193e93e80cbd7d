use std::io;

use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

/// Reason code for a clean close.
pub const SUCCESS: i32 = 0;

/// The error taxonomy shared by every component in the crate.
///
/// Each component owns a disjoint numeric range (see [`NetError::code`]) so
/// a reason code surfaced through an event identifies its origin without
/// carrying the component name. Kernel errors keep their own namespace:
/// they map to negative codes so they never collide with ours.
#[derive(Error, Debug)]
pub enum NetError {
    // Argument errors: 1..=19.
    #[error("the arg is invalid")]
    InvalidArg,
    /// A required target is absent. References cannot be null here, so this
    /// surfaces where an id-shaped argument carries the reserved "none"
    /// value, e.g. a send aimed at LinkID 0.
    #[error("the target is null")]
    NullPointer,
    #[error("the string is empty")]
    StringEmpty,

    // State errors: 20..=39.
    #[error("the state is error")]
    StateError,
    #[error("the link id is invalid")]
    LinkIdInvalid,
    #[error("the link is not exists")]
    NotFoundLink,
    #[error("the operator is not support")]
    NotSupport,
    #[error("the link route already exist")]
    LinkRouteExist,

    // Resource errors: 40..=59.
    #[error("the memory is not enough")]
    MemoryNotEnough,
    #[error("link protocol is full")]
    LinkProtocolFull,
    #[error("link have none protocol")]
    LinkNoneProtocol,

    // Protocol errors: 60..=89.
    #[error("the protocol data is invalid")]
    ProtocolDataInvalid,
    #[error("pack msg failed")]
    PackMsgFailed,
    #[error("unpack msg failed")]
    UnpackMsgFailed,
    #[error("the msg body size max")]
    MsgBodySizeMax,
    #[error("link write data failed")]
    LinkWriteDataFailed,
    #[error("parse http failed")]
    HttpParseFailed,
    #[error("web socket handshake failed")]
    WsHandshakeFailed,
    #[error("web socket not handshake")]
    WsNotHandshake,

    // Timing errors: 90..=99.
    #[error("the link keep alive timeout")]
    KeepAliveTimeout,
    #[error("the link keep alive failed")]
    KeepAliveFailed,

    // Addressing errors: 100..=109.
    #[error("the sock address is invalid")]
    SockAddrInvalid,
    #[error("url is invalid")]
    InvalidUrl,
    #[error("the sock type is invalid")]
    InvalidSockType,

    // Request errors: 110..=119.
    #[error("add net req failed")]
    AddNetReqFailed,

    /// Kernel / poll errors, namespace preserved via negative codes.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Stable numeric code; `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            NetError::InvalidArg => 1,
            NetError::NullPointer => 2,
            NetError::StringEmpty => 3,
            NetError::StateError => 20,
            NetError::LinkIdInvalid => 21,
            NetError::NotFoundLink => 22,
            NetError::NotSupport => 23,
            NetError::LinkRouteExist => 24,
            NetError::MemoryNotEnough => 40,
            NetError::LinkProtocolFull => 41,
            NetError::LinkNoneProtocol => 42,
            NetError::ProtocolDataInvalid => 60,
            NetError::PackMsgFailed => 61,
            NetError::UnpackMsgFailed => 62,
            NetError::MsgBodySizeMax => 63,
            NetError::LinkWriteDataFailed => 64,
            NetError::HttpParseFailed => 65,
            NetError::WsHandshakeFailed => 66,
            NetError::WsNotHandshake => 67,
            NetError::KeepAliveTimeout => 90,
            NetError::KeepAliveFailed => 91,
            NetError::SockAddrInvalid => 100,
            NetError::InvalidUrl => 101,
            NetError::InvalidSockType => 102,
            NetError::AddNetReqFailed => 110,
            NetError::Io(e) => io_code(e),
        }
    }
}

/// Maps a kernel error into the negative code namespace.
pub fn io_code(e: &io::Error) -> i32 {
    if let Some(raw) = e.raw_os_error() {
        return -raw;
    }
    match e.kind() {
        io::ErrorKind::UnexpectedEof => -1001,
        io::ErrorKind::WriteZero => -1002,
        io::ErrorKind::TimedOut => -1003,
        _ => -1000,
    }
}

impl From<weft_codec::CodecError> for NetError {
    fn from(err: weft_codec::CodecError) -> Self {
        match err {
            weft_codec::CodecError::ReadBuffer => NetError::UnpackMsgFailed,
            _ => NetError::ProtocolDataInvalid,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_disjoint_and_stable() {
        let errs = [
            NetError::InvalidArg,
            NetError::NullPointer,
            NetError::StringEmpty,
            NetError::StateError,
            NetError::LinkIdInvalid,
            NetError::NotFoundLink,
            NetError::NotSupport,
            NetError::LinkRouteExist,
            NetError::MemoryNotEnough,
            NetError::LinkProtocolFull,
            NetError::LinkNoneProtocol,
            NetError::ProtocolDataInvalid,
            NetError::PackMsgFailed,
            NetError::UnpackMsgFailed,
            NetError::MsgBodySizeMax,
            NetError::LinkWriteDataFailed,
            NetError::HttpParseFailed,
            NetError::WsHandshakeFailed,
            NetError::WsNotHandshake,
            NetError::KeepAliveTimeout,
            NetError::KeepAliveFailed,
            NetError::SockAddrInvalid,
            NetError::InvalidUrl,
            NetError::InvalidSockType,
            NetError::AddNetReqFailed,
        ];
        let mut seen = std::collections::HashSet::new();
        for e in &errs {
            assert!(e.code() > 0, "{e}");
            assert!(seen.insert(e.code()), "duplicate code for {e}");
        }
    }

    #[test]
    fn io_codes_are_negative() {
        let eof = NetError::Io(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(eof.code() < 0);
        let os = NetError::Io(io::Error::from_raw_os_error(104));
        assert_eq!(os.code(), -104);
    }
}
