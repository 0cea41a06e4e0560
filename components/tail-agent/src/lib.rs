//! VES tail agent.
//!
//! Follows the newest log file matching a pattern in each configured
//! project's directories, forwards every new line to a sink and persists the
//! byte offset it has reached so a restart resumes where it stopped.

pub mod cli;
pub mod helpers;
pub mod instrumentation;
pub mod metrics;
pub mod monitor;
pub mod parser;
pub mod position;
pub mod runtime;
pub mod sink;
pub mod tailer;
pub mod watcher;
