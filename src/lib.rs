// injectlog library - exposes the log protection core for the CLI and for testing

pub mod config;
pub mod config_io;
pub mod services;

pub use services::protection::{
    AppendReport, BindReport, CaptureMode, CaptureResult, Entry, EntryKind, IntegrityStatus,
    LogProtectionService, ProtectionError, RecoveryReport,
};
