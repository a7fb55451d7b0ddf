//! Output reader task.
//!
//! One reader runs per program start. It drains the child's piped stdout and
//! stderr line by line into the program's log buffer — merging the two pipes
//! at line granularity into the single combined stream callers see — and,
//! once both pipes reach end-of-file, reaps the child and records its exit.
//!
//! The reader is one-shot: it runs exactly once per process instance and
//! self-terminates. If the stop path or the health monitor reconciled the
//! exit first, the record's handle is already gone and the reader's own
//! reconciliation is a no-op.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{ChildStderr, ChildStdout};
use tracing::{debug, error};

use super::{ProgramStatus, SharedRecords};

/// Drain a child's output pipes into its log buffer until both close, then
/// reconcile the exit.
pub(crate) async fn drain(
    records: SharedRecords,
    id: u32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) {
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());

    while out.is_some() || err.is_some() {
        let next = tokio::select! {
            line = next_line(&mut out), if out.is_some() => {
                if matches!(&line, Ok(None)) {
                    out = None;
                }
                line
            }
            line = next_line(&mut err), if err.is_some() => {
                if matches!(&line, Ok(None)) {
                    err = None;
                }
                line
            }
        };

        match next {
            Ok(Some(line)) => append(&records, id, &line).await,
            Ok(None) => {}
            Err(e) => {
                // Leave status reconciliation to the health monitor.
                error!(program_id = id, error = %e, "output read failed");
                return;
            }
        }
    }

    reconcile_exit(&records, id).await;
}

async fn next_line<R>(lines: &mut Option<Lines<R>>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

async fn append(records: &SharedRecords, id: u32, line: &str) {
    let mut records = records.lock().await;
    if let Some(record) = records.get_mut(&id) {
        record.log(line);
    }
}

/// Reap the child and record its exit, unless another path got there first.
async fn reconcile_exit(records: &SharedRecords, id: u32) {
    let child = {
        let mut records = records.lock().await;
        match records.get_mut(&id) {
            Some(record) => record.handle.take(),
            None => return,
        }
    };
    let Some(mut child) = child else {
        // Stop path or monitor already reaped it.
        return;
    };

    // Both pipes are closed, so this wait does not block meaningfully; the
    // lock is still released around it.
    let status = child.wait().await;

    let mut records = records.lock().await;
    let Some(record) = records.get_mut(&id) else {
        return;
    };
    record.set_status(ProgramStatus::Stopped);
    match status {
        Ok(status) => match status.code() {
            Some(code) => record.log(&format!("exited with code {code}")),
            None => record.log("exited (terminated by signal)"),
        },
        Err(e) => record.log(&format!("exited (wait failed: {e})")),
    }
    debug!(program_id = id, "output reader finished");
}
