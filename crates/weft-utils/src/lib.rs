mod arrayvec;
mod assert;
mod cache;
mod event;

pub use arrayvec::ArrayVec;
pub use cache::{ObjectCache, Reuse};
pub use event::{Event, ListenerId};
