//! # ikewarden-core
//!
//! Foundation layer for the key-management daemon: time and the event scheduler.
//!
//! ### Key Submodules:
//! - `time`: `Timestamp`, the `Clock` trait, `VirtualClock` and `SystemClock`
//! - `scheduler`: deadline-ordered event queue with cancellable handles
//!
//! Everything here is single-threaded except `VirtualClock`, which is shared
//! between simulated peers.

pub mod error;
pub mod scheduler;
pub mod time;

pub mod prelude {
    pub use crate::error::*;
    pub use crate::scheduler::*;
    pub use crate::time::*;
}

pub use error::SchedulerError;
pub use scheduler::{Event, Scheduler, TimerHandle};
pub use time::{Clock, SystemClock, Timestamp, VirtualClock};
