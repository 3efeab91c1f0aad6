use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand};
use injectlog::config::{self, MANUAL_STREAM};
use injectlog::config_io::DirectoryContext;
use injectlog::services::incident_log::IncidentLogHandle;
use injectlog::services::instance::{is_valid_instance_id, InstanceIdentity};
use injectlog::services::log_dirs;
use injectlog::services::process::current_pid;
use injectlog::services::protection::{
    CaptureResult, Entry, EntryKind, LogProtectionService, RecoveryOutcome, RecoverySource,
    ServiceSettings,
};
use injectlog::services::time_source::{RealTimeSource, SharedTimeSource};
use injectlog::services::tracing_setup;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Append-only command log with incremental backups and automatic recovery
#[derive(Parser, Debug)]
#[command(name = "injectlog")]
#[command(about = "Protected append-only log for text injection tools", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Path to log file for diagnostics (default: XDG state dir)
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Directory holding locks and instance files (default: data dir)
    #[arg(long, value_name = "PATH", global = true)]
    app_root: Option<PathBuf>,

    /// Use this instance id instead of the persisted one
    #[arg(long, value_name = "ID", global = true)]
    instance_id: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    dump_config: bool,

    /// Print the JSON schema of the configuration file and exit
    #[arg(long)]
    dump_schema: bool,

    /// Print the directories used by injectlog and exit
    #[arg(long)]
    show_paths: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append an entry to the project log
    Append {
        project: PathBuf,
        /// injection, note or capture
        #[arg(long, default_value = "note")]
        kind: EntryKind,
        /// Target application or capture source
        #[arg(long)]
        source: Option<String>,
        /// Entry text, or "-" to read it from stdin
        body: String,
    },
    /// Capture one backup stream now
    Capture {
        project: PathBuf,
        #[arg(long, default_value = MANUAL_STREAM)]
        stream: String,
    },
    /// Run one integrity check, recovering if the log is damaged
    Check { project: PathBuf },
    /// Restore the log from the best available backup
    Recover { project: PathBuf },
    /// Concatenate every segment of a stream
    Reconstruct {
        project: PathBuf,
        #[arg(long)]
        stream: String,
        /// Write a recovered file into the backup directory instead of stdout
        #[arg(long)]
        export: bool,
    },
    /// List backups, ledgers and the secondary directory
    Status { project: PathBuf },
    /// Take a full snapshot on the emergency stream
    Emergency { project: PathBuf },
    /// List outdated legacy backups
    Cleanup {
        project: PathBuf,
        /// Delete them instead of listing
        #[arg(long)]
        execute: bool,
    },
    /// Keep checking the log until interrupted
    Watch { project: PathBuf },
    /// Inspect project locks
    Locks {
        #[command(subcommand)]
        action: LocksAction,
    },
}

#[derive(Subcommand, Debug)]
enum LocksAction {
    /// Print every lock and whether its owner is alive
    Show,
    /// Remove locks whose owner is gone
    Sweep,
}

struct SetupState {
    service: LogProtectionService,
    incidents: Option<IncidentLogHandle>,
    time: SharedTimeSource,
}

fn load_config(args: &Args, dirs: &DirectoryContext) -> AnyhowResult<config::Config> {
    let path = args.config.as_deref();
    dirs.load_config(path).with_context(|| match path {
        Some(p) => format!("Failed to load config from {}", p.display()),
        None => format!("Failed to load config from {}", dirs.config_path().display()),
    })
}

fn directory_context(args: &Args) -> AnyhowResult<DirectoryContext> {
    let dirs = DirectoryContext::from_system().context("Failed to resolve system directories")?;
    Ok(match &args.app_root {
        Some(root) => dirs.with_app_root(root.clone()),
        None => dirs,
    })
}

fn initialize_service(args: &Args) -> AnyhowResult<SetupState> {
    let log_file = args.log_file.clone().unwrap_or_else(log_dirs::main_log_path);
    let incidents = tracing_setup::init_global(&log_file, &log_dirs::incidents_log_path());
    log_dirs::cleanup_stale_logs();

    let dirs = directory_context(args)?;
    let config = load_config(args, &dirs)?;
    let time = RealTimeSource::shared();

    let instance = match &args.instance_id {
        Some(id) => {
            if !is_valid_instance_id(id) {
                anyhow::bail!("Invalid instance id '{}' (use letters, digits, '-' or '_')", id);
            }
            InstanceIdentity::with_id(id.clone(), time.as_ref())
        }
        None => InstanceIdentity::load_or_create(&dirs.app_root, time.as_ref())
            .with_context(|| format!("Failed to load instance id from {}", dirs.app_root.display()))?,
    };

    let settings = ServiceSettings {
        secondary_dir: dirs.secondary_dir_for(&config),
        config,
        app_root: dirs.app_root.clone(),
        instance,
        pid: current_pid(),
        time: time.clone(),
    };
    let mut service = LogProtectionService::new(settings).context("Invalid configuration")?;
    let swept = service.start().context("Failed to start log protection")?;
    for project in swept {
        eprintln!("Removed stale lock of project {}", project);
    }
    tracing::info!("injectlog {} started as instance {}", env!("CARGO_PKG_VERSION"), service.instance_id());

    Ok(SetupState {
        service,
        incidents,
        time,
    })
}

fn bind(service: &mut LogProtectionService, project: &Path) -> AnyhowResult<()> {
    let report = service
        .bind_project(project)
        .with_context(|| format!("Failed to bind project {}", project.display()))?;
    tracing::debug!(
        "Bound {} at {:?} (startup capture: {:?})",
        report.project,
        report.log_path,
        report.startup_capture.mode()
    );
    Ok(())
}

fn read_body(body: &str) -> AnyhowResult<String> {
    if body != "-" {
        return Ok(body.to_string());
    }
    let mut text = String::new();
    std::io::stdin()
        .read_to_string(&mut text)
        .context("Failed to read entry from stdin")?;
    Ok(text.trim_end_matches('\n').to_string())
}

fn describe_capture(stream: &str, capture: &CaptureResult) -> String {
    match capture {
        CaptureResult::NoOp => format!("{stream}: no new bytes"),
        CaptureResult::Captured(segment) => format!(
            "{stream}: {} bytes {}..{} -> {}",
            segment.header.mode,
            segment.header.start_offset,
            segment.header.end_offset,
            segment.path.display()
        ),
    }
}

fn describe_recovery(outcome: &RecoveryOutcome) -> String {
    match outcome {
        RecoveryOutcome::Restored(report) => {
            let from = match &report.source {
                RecoverySource::Stream {
                    stream, terminal, ..
                } => format!("stream {} ({})", stream, terminal.display()),
                RecoverySource::Legacy { path } => format!("legacy snapshot {}", path.display()),
            };
            format!("restored {} bytes from {}", report.restored_size, from)
        }
        RecoveryOutcome::Failed { event, reason } => format!("{event}: {reason}"),
    }
}

fn print_incidents(incidents: &Option<IncidentLogHandle>) {
    let Some(handle) = incidents else {
        return;
    };
    for incident in handle.receiver.try_iter() {
        match incident.event {
            Some(event) => eprintln!("{} [{}] {}", incident.level, event, incident.message),
            None => eprintln!("{} {}", incident.level, incident.message),
        }
    }
}

fn run_command(state: &mut SetupState, command: Command) -> AnyhowResult<()> {
    let service = &mut state.service;
    match command {
        Command::Append {
            project,
            kind,
            source,
            body,
        } => {
            bind(service, &project)?;
            let body = read_body(&body)?;
            let source = source.unwrap_or_else(|| kind.as_str().to_string());
            let entry = Entry { kind, source, body };
            let report = service.append_entry(&entry).context("Append failed")?;
            if let Some(outcome) = &report.recovery {
                eprintln!("Log was damaged, {}", describe_recovery(outcome));
            }
            for stream in &report.failed_streams {
                eprintln!("Backup of stream {} failed, will retry", stream);
            }
            println!(
                "Appended {} bytes (log is {} bytes)",
                report.bytes_written, report.log_size
            );
        }
        Command::Capture { project, stream } => {
            bind(service, &project)?;
            let capture = service.capture(&stream).context("Capture failed")?;
            println!("{}", describe_capture(&stream, &capture));
        }
        Command::Check { project } => {
            bind(service, &project)?;
            let report = service.poll().context("Integrity check failed")?;
            println!("{}", report.status.event_name());
            if let Some(outcome) = &report.recovery {
                println!("{}", describe_recovery(outcome));
            }
            for (stream, capture) in &report.captures {
                println!("{}", describe_capture(stream, capture));
            }
        }
        Command::Recover { project } => {
            bind(service, &project)?;
            let report = service.recover().context("Recovery failed")?;
            println!("{}", describe_recovery(&RecoveryOutcome::Restored(report.clone())));
            if let Some(preserved) = report.preserved {
                println!("Previous content preserved in {}", preserved.display());
            }
        }
        Command::Reconstruct {
            project,
            stream,
            export,
        } => {
            bind(service, &project)?;
            if export {
                let path = service
                    .export_reconstruction(&stream)
                    .context("Reconstruction failed")?;
                println!("{}", path.display());
            } else {
                let text = service.reconstruct(&stream).context("Reconstruction failed")?;
                print!("{}", text);
            }
        }
        Command::Status { project } => {
            bind(service, &project)?;
            let report = service.status().context("Failed to read backup status")?;
            println!("Project {}", report.project);
            match report.log_size {
                Some(size) => println!("Log: {} bytes", size),
                None => println!("Log: missing"),
            }
            println!();
            println!("Backups ({}):", report.backups.len());
            for info in &report.backups {
                let modified = info
                    .modified
                    .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:>10}  {}  {:<28} {}",
                    info.size,
                    modified,
                    info.kind.label(),
                    info.path.display()
                );
            }
            println!();
            println!("Ledgers:");
            for ledger in &report.ledgers {
                let latest = ledger
                    .latest
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "no latest copy".to_string());
                println!("  {:<16} offset {:>10}  {}", ledger.stream, ledger.offset, latest);
            }
            println!();
            println!("Secondary ({}):", report.secondary.len());
            for info in &report.secondary {
                println!("  {:>10}  {}", info.size, info.path.display());
            }
        }
        Command::Emergency { project } => {
            bind(service, &project)?;
            let capture = service.emergency_backup().context("Emergency backup failed")?;
            println!("{}", describe_capture("emergency", &capture));
        }
        Command::Cleanup { project, execute } => {
            bind(service, &project)?;
            let report = service.cleanup_legacy(execute).context("Cleanup failed")?;
            for (path, reason) in &report.candidates {
                println!("{}  ({})", path.display(), reason);
            }
            if execute {
                println!(
                    "Deleted {} of {} files",
                    report.deleted.len(),
                    report.candidates.len()
                );
            } else {
                println!(
                    "{} files, {} bytes reclaimable (dry run, pass --execute to delete)",
                    report.candidates.len(),
                    report.reclaimable_bytes
                );
            }
        }
        Command::Watch { project } => {
            bind(service, &project)?;
            let interval = service.poll_interval();
            println!("Watching {} every {:?}", project.display(), interval);
            loop {
                match service.poll() {
                    Ok(report) => {
                        if let Some(outcome) = &report.recovery {
                            println!("{}: {}", report.status.event_name(), describe_recovery(outcome));
                        }
                    }
                    Err(e) => tracing::error!("Poll failed: {}", e),
                }
                print_incidents(&state.incidents);
                state.time.sleep(interval);
            }
        }
        Command::Locks { action } => {
            match action {
                LocksAction::Show => {
                    for record in service.locks().list().context("Failed to list locks")? {
                        match record.info {
                            Some(info) => println!(
                                "{:<24} instance {} pid {} since {} ({})",
                                record.project,
                                info.instance_id,
                                info.pid,
                                info.lock_time.format("%Y-%m-%d %H:%M:%S"),
                                if record.live { "live" } else { "stale" }
                            ),
                            None => println!("{:<24} unreadable ({})", record.project, record.path.display()),
                        }
                    }
                }
                LocksAction::Sweep => {
                    let removed = service.locks().sweep_stale().context("Failed to sweep locks")?;
                    println!("Removed {} stale locks", removed.len());
                }
            }
        }
    }
    Ok(())
}

fn main() -> AnyhowResult<()> {
    let mut args = Args::parse();

    if args.dump_schema {
        let schema = schemars::schema_for!(config::Config);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    if args.show_paths || args.dump_config {
        let dirs = directory_context(&args)?;
        let config = load_config(&args, &dirs)?;
        if args.show_paths {
            let config_path = args.config.clone().unwrap_or_else(|| dirs.config_path());
            log_dirs::print_all_paths(&config_path, &dirs.app_root, &dirs.secondary_dir_for(&config));
        } else {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?
            );
        }
        return Ok(());
    }

    let Some(command) = args.command.take() else {
        anyhow::bail!("No command given (see --help)");
    };

    let mut state = initialize_service(&args)?;
    let result = run_command(&mut state, command);
    print_incidents(&state.incidents);
    if let Err(e) = &result {
        tracing::error!("Command failed: {:#}", e);
    }
    result
}
