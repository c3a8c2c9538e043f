//! Single-threaded async runtime: task slots, ppoll-driven fd readiness,
//! deadline timers and the `log` backend

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod config;
pub use config::*;

mod io_registry;
pub mod logger;
mod scheduler;
mod timer;

// Re-export public API
pub use logger::{LOG_FD, log_write};
pub use scheduler::{Handle, Runtime};
pub use timer::Sleep;
