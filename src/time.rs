//! Time sources for bus-level deadlines and handshake pauses.
//!
//! Every wait on the card (ready, start token) is a busy poll against a
//! free-running clock through an `embedded-timers` [`Timer`]. The 1 ms
//! pauses of the handshake use its [`Delay`]. Nothing here yields.

pub use embedded_timers::clock::Clock;
pub use embedded_timers::delay::Delay;
pub use embedded_timers::timer::Timer;

#[cfg(feature = "std")]
pub use embedded_timers::clock::StdClock;
