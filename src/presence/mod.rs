//! Driver presence: online toggle, order queue and pushed order events.

pub mod board;
pub mod channel;

pub use board::DriverBoard;
pub use channel::PresenceChannel;
