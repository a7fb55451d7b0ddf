//! progman-core - program supervision engine.
//!
//! Supervises a fixed set of configured child programs: starts them, stops
//! them (gracefully, then forcibly), tracks live/dead status, captures their
//! combined output into a bounded rolling buffer, and exposes that buffer as
//! a snapshot or as a backlog-then-live stream.
//!
//! The [`supervisor::Supervisor`] owns all per-program state behind a single
//! lock. Two kinds of background tasks write into it: one output reader per
//! running program, and one shared health monitor that reconciles programs
//! which exited outside the reader's detection path.

pub mod config;
pub mod logbuf;
pub mod supervisor;

pub use config::{ConfigError, ManagerConfig, Program, SupervisorConfig};
pub use supervisor::{LogStream, ProgramState, ProgramStatus, Supervisor};
