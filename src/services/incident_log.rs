//! Incident log layer for tracing
//!
//! Copies WARN and ERROR events to a separate file so damage detections,
//! failed captures and recoveries can be reviewed without the debug noise of
//! the main log. Events carrying an `event` field (for example
//! `LOG_FILE_CLEARED`) are prefixed with it. Repeats of the same incident
//! within a short window are folded into a count.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::Level;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// One line written to the incident log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub level: Level,
    /// Value of the `event` field, if the call site set one
    pub event: Option<String>,
    pub message: String,
}

struct DeduplicationState {
    /// incident key -> (last seen, occurrences since last write)
    recent: HashMap<String, (Instant, usize)>,
    window: Duration,
    max_entries: usize,
}

impl DeduplicationState {
    fn new(window: Duration) -> Self {
        Self {
            recent: HashMap::new(),
            window,
            max_entries: 100,
        }
    }

    /// Returns `None` to suppress, otherwise the number of suppressed repeats
    /// to report alongside this occurrence
    fn check(&mut self, key: &str, now: Instant) -> Option<usize> {
        if self.recent.len() > self.max_entries {
            let keep = self.window * 2;
            self.recent
                .retain(|_, (seen, _)| now.duration_since(*seen) < keep);
        }

        match self.recent.get_mut(key) {
            Some((last_seen, count)) if now.duration_since(*last_seen) < self.window => {
                *count += 1;
                *last_seen = now;
                None
            }
            Some((last_seen, count)) => {
                let suppressed = count.saturating_sub(1);
                *count = 1;
                *last_seen = now;
                Some(suppressed)
            }
            None => {
                self.recent.insert(key.to_string(), (now, 1));
                Some(0)
            }
        }
    }
}

/// A tracing layer that writes WARN+ events to a file and reports each one
/// on a channel
pub struct IncidentLogLayer {
    file: Arc<Mutex<File>>,
    sender: mpsc::Sender<Incident>,
    dedup: Arc<Mutex<DeduplicationState>>,
}

/// Receiving side of the incident log
pub struct IncidentLogHandle {
    pub receiver: mpsc::Receiver<Incident>,
    pub path: PathBuf,
}

pub fn create_with_path(path: PathBuf) -> std::io::Result<(IncidentLogLayer, IncidentLogHandle)> {
    create_with_window(path, Duration::from_secs(5))
}

fn create_with_window(
    path: PathBuf,
    window: Duration,
) -> std::io::Result<(IncidentLogLayer, IncidentLogHandle)> {
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let (sender, receiver) = mpsc::channel();

    let layer = IncidentLogLayer {
        file: Arc::new(Mutex::new(file)),
        sender,
        dedup: Arc::new(Mutex::new(DeduplicationState::new(window))),
    };
    Ok((layer, IncidentLogHandle { receiver, path }))
}

impl<S> Layer<S> for IncidentLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = IncidentVisitor::default();
        event.record(&mut visitor);

        let key = format!(
            "{}|{}",
            visitor.event.as_deref().unwrap_or(""),
            visitor.message
        );
        let suppressed = match self.dedup.lock() {
            Ok(mut dedup) => dedup.check(&key, Instant::now()),
            Err(_) => Some(0),
        };
        let Some(suppressed) = suppressed else {
            return;
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let mut line = format!("{} {}", timestamp, level);
        if let Some(name) = &visitor.event {
            line.push_str(&format!(" [{}]", name));
        }
        line.push_str(&format!(" {}: {}", event.metadata().target(), visitor.message));
        if suppressed > 0 {
            line.push_str(&format!(" (suppressed {} repeats)", suppressed));
        }
        line.push('\n');

        // DEBUG events return early above, so reporting here cannot recurse
        let written = match self.file.lock() {
            Ok(mut file) => file.write_all(line.as_bytes()).and_then(|()| file.flush()),
            Err(_) => Err(std::io::Error::other("incident log file lock poisoned")),
        };
        if let Err(e) = written {
            tracing::debug!("Failed to write incident log: {}", e);
        }

        if self
            .sender
            .send(Incident {
                level,
                event: visitor.event,
                message: visitor.message,
            })
            .is_err()
        {
            tracing::debug!("Incident receiver dropped, incident kept in file only");
        }
    }
}

/// Splits the `event` field from the rest of the event's fields
#[derive(Default)]
struct IncidentVisitor {
    event: Option<String>,
    message: String,
}

impl IncidentVisitor {
    fn push_field(&mut self, name: &str, value: String) {
        match name {
            "event" => self.event = Some(value),
            "message" => {
                if self.message.is_empty() {
                    self.message = value;
                } else {
                    self.message = format!("{} {}", value, self.message);
                }
            }
            _ => {
                if !self.message.is_empty() {
                    self.message.push(' ');
                }
                self.message.push_str(&format!("{}={}", name, value));
            }
        }
    }
}

impl tracing::field::Visit for IncidentVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.push_field(field.name(), format!("{:?}", value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.push_field(field.name(), value.to_string());
    }
}
