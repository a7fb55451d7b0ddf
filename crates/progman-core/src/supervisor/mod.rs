//! Process supervision.
//!
//! The [`Supervisor`] owns one [`ProcessRecord`] per configured program,
//! created at construction and kept for the supervisor's whole lifetime.
//! All record state — process handle, status, last-update stamp, and log
//! buffer — lives behind a single coarse `tokio::sync::Mutex`, which is what
//! keeps the `Running` ⇔ handle-present invariant atomic across the three
//! kinds of writers: foreground callers, per-process output readers, and the
//! shared health monitor. The lock is never held across a blocking wait;
//! handles are taken out of the record first and reaped without it.

mod monitor;
mod reader;
mod stream;

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::config::{ManagerConfig, Program, SupervisorConfig};
use crate::logbuf::LogBuffer;

pub use stream::LogStream;

/// Lifecycle status of a supervised program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    /// Not running; the initial state and the terminal state of every stop.
    Stopped,
    /// Launched and not yet observed exited.
    Running,
    /// The last launch attempt failed.
    Error,
}

impl ProgramStatus {
    /// Lower-case name, matching the serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime state tracked per program.
///
/// Invariant: `status == Running` implies `handle` is present and has not
/// been observed exited. Every transition out of `Running` first takes or
/// reaps the handle.
pub(crate) struct ProcessRecord {
    pub(crate) handle: Option<Child>,
    pub(crate) status: ProgramStatus,
    pub(crate) last_update: Option<DateTime<Utc>>,
    pub(crate) logs: LogBuffer,
}

impl ProcessRecord {
    fn new(log_capacity: usize) -> Self {
        Self {
            handle: None,
            status: ProgramStatus::Stopped,
            last_update: None,
            logs: LogBuffer::new(log_capacity),
        }
    }

    /// Append a buffer line and stamp the record.
    pub(crate) fn log(&mut self, message: &str) {
        self.logs.append(message);
        self.last_update = Some(Utc::now());
    }

    pub(crate) fn set_status(&mut self, status: ProgramStatus) {
        self.status = status;
        self.last_update = Some(Utc::now());
    }
}

pub(crate) type RecordMap = BTreeMap<u32, ProcessRecord>;
pub(crate) type SharedRecords = Arc<Mutex<RecordMap>>;

/// Point-in-time view of one program, as reported by
/// [`Supervisor::status_snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ProgramState {
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: ProgramStatus,
    /// OS pid, present only when the handle exists and a liveness probe
    /// confirms the process has not exited.
    pub pid: Option<u32>,
    /// Time of the most recent status or log mutation.
    pub last_update: Option<DateTime<Utc>>,
}

/// How a stop attempt ended; drives the diagnostic line and return value.
enum StopOutcome {
    Graceful,
    Forced,
    Failed(String),
}

/// Supervises a fixed set of programs.
///
/// Construction loads the program identities, creates their records, and
/// launches the health monitor; [`shutdown`](Self::shutdown) stops every
/// running program and ends the monitor and any attached streams.
pub struct Supervisor {
    programs: BTreeMap<u32, Program>,
    records: SharedRecords,
    config: SupervisorConfig,
    shutdown: watch::Sender<bool>,
}

impl Supervisor {
    /// Build a supervisor from configuration and start its health monitor.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Self {
        let ManagerConfig {
            supervisor: tuning,
            programs,
        } = config;

        let programs: BTreeMap<u32, Program> =
            programs.into_iter().map(|p| (p.id, p)).collect();
        let records: RecordMap = programs
            .keys()
            .map(|&id| (id, ProcessRecord::new(tuning.log_capacity)))
            .collect();
        let records = Arc::new(Mutex::new(records));

        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(monitor::run(
            Arc::clone(&records),
            shutdown_rx,
            tuning.monitor_interval,
            tuning.monitor_backoff,
        ));

        Self {
            programs,
            records,
            config: tuning,
            shutdown,
        }
    }

    /// Ids of all configured programs, ascending.
    #[must_use]
    pub fn program_ids(&self) -> Vec<u32> {
        self.programs.keys().copied().collect()
    }

    /// Start a program.
    ///
    /// Returns `false` without launching anything for an unknown id, a
    /// program that is already running (decided by probing the handle, not
    /// the stored status), a missing entry point, or a spawn failure. All
    /// refusals leave a diagnostic line in the program's log buffer; a spawn
    /// failure additionally sets the status to [`ProgramStatus::Error`].
    pub async fn start(&self, id: u32) -> bool {
        let Some(program) = self.programs.get(&id) else {
            warn!(program_id = id, "start requested for unknown program");
            return false;
        };

        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            return false;
        };

        // Probe liveness rather than trusting the stored status; the process
        // may have exited between monitor passes.
        if let Some(child) = record.handle.as_mut() {
            match child.try_wait() {
                Ok(None) => {
                    warn!(program_id = id, "program is already running");
                    record.log("start refused: already running");
                    return false;
                }
                Ok(Some(status)) => {
                    // Exited but not yet reconciled; try_wait reaped it.
                    // Record the exit here so a refusal further down cannot
                    // leave the record running without a handle.
                    record.handle = None;
                    record.set_status(ProgramStatus::Stopped);
                    match status.code() {
                        Some(code) => record.log(&format!("exited with code {code}")),
                        None => record.log("exited (terminated by signal)"),
                    }
                }
                Err(e) => {
                    error!(program_id = id, error = %e, "liveness probe failed");
                    record.handle = None;
                    record.set_status(ProgramStatus::Stopped);
                }
            }
        }

        let entry = program.entry_point();
        if !entry.exists() {
            error!(program_id = id, path = %entry.display(), "entry point not found");
            record.log(&format!("entry point not found: {}", entry.display()));
            return false;
        }

        let mut command = Command::new(&entry);
        command
            .args(&program.args)
            .current_dir(&program.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(program_id = id, error = %e, "failed to spawn program");
                record.set_status(ProgramStatus::Error);
                record.log(&format!("failed to start: {e}"));
                return false;
            }
        };

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        record.handle = Some(child);
        record.set_status(ProgramStatus::Running);
        match pid {
            Some(pid) => record.log(&format!("started (pid={pid})")),
            None => record.log("started"),
        }

        tokio::spawn(reader::drain(Arc::clone(&self.records), id, stdout, stderr));

        info!(program_id = id, pid, "program started");
        true
    }

    /// Stop a program.
    ///
    /// Stopping a program that is not running is an idempotent success and
    /// forces the status to [`ProgramStatus::Stopped`]. A running program is
    /// sent SIGTERM, given the configured grace period, and killed outright
    /// if it has not exited by then. Only a failure of the forced path
    /// returns `false`.
    pub async fn stop(&self, id: u32) -> bool {
        if !self.programs.contains_key(&id) {
            warn!(program_id = id, "stop requested for unknown program");
            return false;
        }

        // Take the handle out under the lock; wait for the exit without it.
        let taken = {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&id) else {
                return false;
            };

            let live = record
                .handle
                .as_mut()
                .is_some_and(|child| matches!(child.try_wait(), Ok(None)));
            if !live {
                record.handle = None;
                record.set_status(ProgramStatus::Stopped);
                debug!(program_id = id, "stop requested while not running");
                return true;
            }
            record.handle.take()
        };
        let Some(mut child) = taken else {
            return true;
        };

        let pid = child.id();
        terminate_gracefully(&mut child, pid);

        let outcome = match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(_)) => StopOutcome::Graceful,
            Ok(Err(e)) => StopOutcome::Failed(format!("wait failed: {e}")),
            Err(_) => {
                warn!(program_id = id, "graceful stop timed out, killing");
                match child.start_kill() {
                    Ok(()) => match child.wait().await {
                        Ok(_) => StopOutcome::Forced,
                        Err(e) => StopOutcome::Failed(format!("wait after kill failed: {e}")),
                    },
                    Err(e) => StopOutcome::Failed(format!("kill failed: {e}")),
                }
            }
        };

        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            return false;
        };
        record.set_status(ProgramStatus::Stopped);
        let pid_label = pid.map_or_else(|| "unknown".to_string(), |p| p.to_string());
        match outcome {
            StopOutcome::Graceful => {
                record.log(&format!("stopped gracefully (pid={pid_label})"));
                info!(program_id = id, pid, "program stopped gracefully");
                true
            }
            StopOutcome::Forced => {
                record.log(&format!("force killed (pid={pid_label})"));
                warn!(program_id = id, pid, "program force killed");
                true
            }
            StopOutcome::Failed(reason) => {
                record.log(&format!("failed to stop: {reason}"));
                error!(program_id = id, pid, reason, "failed to stop program");
                false
            }
        }
    }

    /// Status of every configured program, keyed by id.
    ///
    /// The pid is double-checked against a non-blocking liveness probe so a
    /// process that died since the last reconciliation is never reported
    /// with a stale pid.
    pub async fn status_snapshot(&self) -> BTreeMap<u32, ProgramState> {
        let mut records = self.records.lock().await;
        let mut snapshot = BTreeMap::new();
        for (id, program) in &self.programs {
            let Some(record) = records.get_mut(id) else {
                continue;
            };
            let pid = record.handle.as_mut().and_then(|child| {
                match child.try_wait() {
                    Ok(None) => child.id(),
                    _ => None,
                }
            });
            snapshot.insert(
                *id,
                ProgramState {
                    name: program.name.clone(),
                    status: record.status,
                    pid,
                    last_update: record.last_update,
                },
            );
        }
        snapshot
    }

    /// Snapshot copy of a program's buffered log lines.
    ///
    /// Unknown ids yield an empty vector.
    pub async fn logs(&self, id: u32) -> Vec<String> {
        let records = self.records.lock().await;
        records.get(&id).map(|r| r.logs.snapshot()).unwrap_or_default()
    }

    /// Buffered lines whose embedded timestamp is strictly after `since`.
    ///
    /// Lines with an unparseable timestamp are included rather than dropped.
    pub async fn logs_since(&self, id: u32, since: NaiveDateTime) -> Vec<String> {
        let records = self.records.lock().await;
        records.get(&id).map(|r| r.logs.since(since)).unwrap_or_default()
    }

    /// Empty a program's log buffer, leaving a single marker line.
    ///
    /// Returns `false` for unknown ids.
    pub async fn clear_logs(&self, id: u32) -> bool {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&id) else {
            warn!(program_id = id, "clear_logs requested for unknown program");
            return false;
        };
        record.logs.clear();
        record.log("logs cleared");
        debug!(program_id = id, "logs cleared");
        true
    }

    /// Attach a backlog-then-live log stream to a program.
    ///
    /// Returns `None` for unknown ids. The stream replays the most recent
    /// backlog lines first and then yields newly appended lines until the
    /// consumer drops it or the supervisor shuts down.
    pub async fn stream(&self, id: u32) -> Option<LogStream> {
        let records = self.records.lock().await;
        let record = records.get(&id)?;
        let backlog = record.logs.tail(self.config.stream_backlog);
        let seen = record.logs.appended();
        Some(LogStream::new(
            Arc::clone(&self.records),
            id,
            backlog,
            seen,
            self.config.stream_poll,
            self.shutdown.subscribe(),
        ))
    }

    /// Stop every running program and end the background tasks.
    ///
    /// Attached streams observe the shutdown and terminate.
    pub async fn shutdown(&self) {
        info!("supervisor shutting down");
        let _ = self.shutdown.send(true);
        for id in self.program_ids() {
            self.stop(id).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> &SharedRecords {
        &self.records
    }
}

/// Request graceful termination: SIGTERM when the pid is known, an outright
/// kill when it is not (the process was already reaped and has no id).
fn terminate_gracefully(child: &mut Child, pid: Option<u32>) {
    match pid {
        Some(pid) => {
            #[allow(clippy::cast_possible_wrap)] // OS pids fit in i32
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                warn!(error = %e, "failed to deliver SIGTERM");
            }
        }
        None => {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "failed to kill process without pid");
            }
        }
    }
}
