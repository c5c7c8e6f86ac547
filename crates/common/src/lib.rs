//! Common utilities for usbfs-engine
//!
//! This crate provides the ambient pieces shared by the engine and its
//! callers: error handling, logging setup, the per-thread run loop used to
//! deliver callbacks back to their issuing thread, the command channel into a
//! device I/O thread, and test helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod task_runner;
pub mod test_utils;

pub use channel::{CommandReceiver, CommandSender, WakeFn, command_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use task_runner::{RunLoop, Task, TaskRunner};
