//! Tracing subscriber setup
//!
//! Shared by the command-line front end and the tests.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use super::incident_log::{IncidentLogHandle, IncidentLogLayer};

/// Install the global subscriber: file logging filtered by `RUST_LOG`
/// (DEBUG by default) plus the incident layer.
///
/// Returns `None` if either file could not be created.
pub fn init_global(log_file_path: &Path, incident_path: &Path) -> Option<IncidentLogHandle> {
    let (incident_layer, incident_handle) =
        super::incident_log::create_with_path(incident_path.to_path_buf()).ok()?;
    let log_file = File::create(log_file_path).ok()?;

    build_subscriber(log_file, Some(incident_layer)).init();
    Some(incident_handle)
}

pub fn build_subscriber(
    log_file: File,
    incident_layer: Option<IncidentLogLayer>,
) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into());

    let fmt_layer = fmt::layer().with_ansi(false).with_writer(Arc::new(log_file));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .with(incident_layer)
}
