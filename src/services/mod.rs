//! Services backing the log protection core
//!
//! This module contains all code that touches the filesystem, the process
//! table and the clock.

#[cfg(feature = "runtime")]
pub mod incident_log;
pub mod instance;
pub mod log_dirs;
pub mod process;
pub mod protection;
pub mod time_source;
#[cfg(feature = "runtime")]
pub mod tracing_setup;
