//! Health monitor task.
//!
//! A single long-lived task, started at supervisor construction, that
//! periodically probes every record marked running. A process that exited
//! without going through the reader's detection path — or whose reader died
//! on a stream error — is reconciled to stopped here, with a marker line
//! distinct from the graceful-stop path.
//!
//! The monitor is a backstop, not the primary exit detector; it is safe to
//! run redundantly with the reader because whichever task takes the handle
//! first wins and the other observes "already stopped" and no-ops.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use super::{ProgramStatus, SharedRecords};

/// Run monitor passes every `interval` until shutdown is signalled.
///
/// A failed pass is logged and followed by the longer `backoff` sleep; the
/// loop itself never terminates on error.
pub(crate) async fn run(
    records: SharedRecords,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
    backoff: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if let Err(e) = check_once(&records).await {
            error!(error = %e, "health monitor pass failed");
            tokio::time::sleep(backoff).await;
        }
    }
    debug!("health monitor stopped");
}

/// One monitoring pass: reconcile every running record whose process has
/// already exited.
pub(crate) async fn check_once(records: &SharedRecords) -> std::io::Result<()> {
    let mut records = records.lock().await;
    for (id, record) in records.iter_mut() {
        if record.status != ProgramStatus::Running {
            continue;
        }
        // A running record without a handle is mid-reconciliation by the
        // reader or stop path; leave it to them.
        let Some(child) = record.handle.as_mut() else {
            continue;
        };

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                record.handle = None;
                record.set_status(ProgramStatus::Stopped);
                match status.code() {
                    Some(code) => {
                        record.log(&format!("ended unexpectedly with exit code {code}"));
                    }
                    None => record.log("ended unexpectedly (terminated by signal)"),
                }
                warn!(program_id = *id, "program ended unexpectedly");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
