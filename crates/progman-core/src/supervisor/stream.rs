//! Backlog-then-live log streaming.
//!
//! A [`LogStream`] is a pull-based sequence of log lines handed out by
//! [`Supervisor::stream`](super::Supervisor::stream). On attach it captures
//! the most recent buffered lines as a backlog; afterwards it polls the
//! buffer and yields newly appended lines in order.
//!
//! Position is tracked by the buffer's global append count, never by buffer
//! index, so concurrent eviction (or a `clear_logs`) can drop lines the
//! consumer has not reached but can never duplicate or skip the ones it has.
//!
//! The sequence is conceptually infinite: it ends only when the consumer
//! drops the stream or the supervisor shuts down. Dropping a stream affects
//! nothing but its own polling loop.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;

use super::SharedRecords;

/// Incremental consumer of one program's log buffer.
pub struct LogStream {
    records: SharedRecords,
    id: u32,
    /// Global append index of the next line to deliver.
    seen: u64,
    /// Backlog replay plus any polled-but-undelivered lines.
    pending: VecDeque<String>,
    poll: Duration,
    shutdown: watch::Receiver<bool>,
}

impl LogStream {
    pub(crate) fn new(
        records: SharedRecords,
        id: u32,
        backlog: Vec<String>,
        seen: u64,
        poll: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            records,
            id,
            seen,
            pending: backlog.into(),
            poll,
            shutdown,
        }
    }

    /// The next log line, waiting for one to be appended if necessary.
    ///
    /// Returns `None` once the supervisor has shut down.
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if *self.shutdown.borrow() {
                return None;
            }

            {
                let records = self.records.lock().await;
                if let Some(record) = records.get(&self.id) {
                    self.pending.extend(record.logs.lines_from(self.seen));
                    self.seen = record.logs.appended();
                }
            }

            if self.pending.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(self.poll) => {}
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            return None;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ManagerConfig, Program, SupervisorConfig};
    use crate::supervisor::Supervisor;

    fn stream_config(log_capacity: usize, backlog: usize) -> ManagerConfig {
        ManagerConfig {
            supervisor: SupervisorConfig {
                log_capacity,
                stream_backlog: backlog,
                stream_poll: Duration::from_millis(10),
                monitor_interval: Duration::from_secs(3600),
                ..SupervisorConfig::default()
            },
            programs: vec![Program {
                id: 1,
                name: "streamed".into(),
                dir: "/".into(),
                command: "/bin/sh".into(),
                args: vec![],
            }],
        }
    }

    async fn append(sup: &Supervisor, message: &str) {
        let mut records = sup.records().lock().await;
        records.get_mut(&1).unwrap().log(message);
    }

    #[tokio::test]
    async fn test_unknown_id_yields_no_stream() {
        let sup = Supervisor::new(stream_config(100, 50));
        assert!(sup.stream(99).await.is_none());
    }

    #[tokio::test]
    async fn test_backlog_replay_oldest_first() {
        let sup = Supervisor::new(stream_config(100, 3));
        for i in 0..5 {
            append(&sup, &format!("line {i}")).await;
        }

        let mut stream = sup.stream(1).await.unwrap();
        // Backlog is the most recent 3 lines, oldest first.
        for expected in ["line 2", "line 3", "line 4"] {
            let line = stream.next_line().await.unwrap();
            assert!(line.ends_with(expected), "got {line:?}");
        }
    }

    #[tokio::test]
    async fn test_live_lines_in_order_without_duplication() {
        let sup = Supervisor::new(stream_config(100, 50));
        let mut stream = sup.stream(1).await.unwrap();

        for i in 0..10 {
            append(&sup, &format!("line {i}")).await;
        }

        for i in 0..10 {
            let line = stream.next_line().await.unwrap();
            assert!(line.ends_with(&format!("line {i}")), "got {line:?}");
        }
    }

    #[tokio::test]
    async fn test_eviction_during_observation_never_skips() {
        // Tiny buffer: everything the consumer is slow about gets evicted.
        let sup = Supervisor::new(stream_config(4, 2));
        let mut stream = sup.stream(1).await.unwrap();

        // Appended while the consumer is not polling; more than capacity.
        for i in 0..4 {
            append(&sup, &format!("early {i}")).await;
        }
        // The consumer drains what survived, in order.
        for expected in ["early 0", "early 1", "early 2", "early 3"] {
            let line = stream.next_line().await.unwrap();
            assert!(line.ends_with(expected), "got {line:?}");
        }

        // Now overflow: lines 0..2 of this batch are evicted before the
        // consumer looks again. Survivors arrive in order, none duplicated.
        for i in 0..6 {
            append(&sup, &format!("late {i}")).await;
        }
        for expected in ["late 2", "late 3", "late 4", "late 5"] {
            let line = stream.next_line().await.unwrap();
            assert!(line.ends_with(expected), "got {line:?}");
        }
    }

    #[tokio::test]
    async fn test_clear_is_observed_as_eviction() {
        let sup = Supervisor::new(stream_config(100, 50));
        for i in 0..3 {
            append(&sup, &format!("line {i}")).await;
        }
        let mut stream = sup.stream(1).await.unwrap();

        sup.clear_logs(1).await;

        // Backlog still replays the attach-time snapshot.
        for expected in ["line 0", "line 1", "line 2"] {
            let line = stream.next_line().await.unwrap();
            assert!(line.ends_with(expected), "got {line:?}");
        }
        // The only new line is the clear marker; nothing is replayed twice.
        let line = stream.next_line().await.unwrap();
        assert!(line.contains("logs cleared"), "got {line:?}");
    }

    #[tokio::test]
    async fn test_shutdown_ends_stream() {
        let sup = Supervisor::new(stream_config(100, 50));
        let mut stream = sup.stream(1).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next_line().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sup.shutdown().await;

        let line = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("stream did not observe shutdown")
            .unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn test_attach_before_any_lines() {
        let sup = Supervisor::new(stream_config(100, 50));
        let mut stream = sup.stream(1).await.unwrap();

        append(&sup, "first ever").await;
        let line = stream.next_line().await.unwrap();
        assert!(line.ends_with("first ever"), "got {line:?}");
    }
}
