//! Liveness supervision for running tasks.
//!
//! A [`Watchdog`] watches [`TaskHandle`]s registered by an executor and
//! reports two kinds of trouble through callbacks: a task still running past
//! its timeout, and a task whose handle reported a failure. It never changes
//! task state itself; whoever registered the callbacks decides what to do.
//!
//! [`IntervalWatchdog`] is the in-process implementation: one tokio task that
//! scans all registrations every `check_interval`.

pub mod error;
pub mod handle;
pub mod interval;
pub mod traits;

pub use error::WatchdogError;
pub use handle::{HandleReporter, HandleStatus, TaskHandle};
pub use interval::IntervalWatchdog;
pub use traits::{Metadata, Watchdog, WatchdogCallback, WatchdogEvent, WatchdogId};
