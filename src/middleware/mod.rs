//! Client-side pacing applied to every outbound RPC.
//!
//! The invocation chain is flood-waiter outermost, so a flood-wait retry
//! re-takes a rate-limit token before it reaches the transport again.

pub mod floodwait;
pub mod ratelimit;

pub use floodwait::FloodWaiter;
pub use ratelimit::RateLimiter;
