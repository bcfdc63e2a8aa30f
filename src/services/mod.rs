//! Runtime services around the engines
//!
//! Logging setup, the queue monitor and the worker that turns monitor
//! notifications into engine passes.

pub mod logger;
pub mod monitor;
pub mod worker;

pub use monitor::{ChangeNotification, QueueMonitor};
