mod event;
mod outcome;

pub use event::{ConnectionId, ProxyEvent};
pub use outcome::Outcome;
