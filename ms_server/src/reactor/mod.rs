//! Event-driven I/O reactor.
//!
//! The reactor waits on the multiplexer, dispatches ready descriptors to their
//! [`FileHandler`]s and then runs expired [`TimerHandler`]s, all on one thread.

pub mod poller;
#[allow(clippy::module_inception)]
pub mod reactor;
pub mod timer;

pub use poller::{Control, Interest, MioPoller, Poller, ReadyEvent};
pub use reactor::{FileHandler, Reactor, ReactorConfig, MAX_TIMERS_PER_TICK};
pub use timer::{TimerHandler, TimerId};
