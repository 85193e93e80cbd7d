//! A single-threaded TCP reactor with per-link protocol pipelines.
//!
//! One mio poll loop multiplexes many links; each link carries an ordered
//! stack of protocol layers (framed messages, text lines, WebSocket) that
//! cooperate on reads, writes and teardown. [`NetProcess`] adapts the
//! reactor to in-thread users; [`NetThread`] hosts it on its own OS thread
//! behind a pair of lock-protected swap queues.

use std::collections::{HashMap, HashSet};

mod buffer;
mod config;
mod ctx;
mod error;
mod link;
mod msg;
mod protocol;
mod reactor;
mod routes;

pub use buffer::{BufferPool, FixedBuffer};
pub use config::NetConfig;
pub use ctx::NetCtx;
pub use error::{NetError, NetResult, SUCCESS};
pub use link::{
    Link, LinkCore, LinkState,
    factory::{LinkFactory, LinkRecipe},
    mgr::LinkMgr,
};
pub use msg::{BodyFlag, ExtraFlag, MsgPtr, NetMsg, RouteFlag, SendFlag};
pub use protocol::{
    MAX_PROTOCOLS, Pipeline, Protocol, ProtocolStack, msg::MsgProtocol, text::TextProtocol,
    websocket::WebSocketProtocol,
};
pub use reactor::{
    LinkCloseArgs, LinkEndArgs, LinkMsgArgs, LinkOpenArgs, LinkStartArgs, Reactor,
    process::NetProcess,
    thread::NetThread,
};
pub use routes::{RouteMap, RouteMgr, pack_route_id};

pub type GroupId = u32;
pub type LinkId = i64;
pub type LinkType = u64;
pub type UserId = i64;
pub type OpcodeId = u32;
pub type ServerType = i16;
pub type ServerId = u32;
pub type ServerIndex = u16;
pub type RouteId = i64;

/// Per-link fan-out targets for a multi-send: every listed user on every
/// listed link receives its own copy of the message.
pub type BroadcastDest = HashMap<LinkId, HashSet<UserId>>;
