//! Log-file ingestion core.
//!
//! A long-running agent component that discovers log files matching
//! configured patterns, follows each one in append mode, reconstructs
//! multi-line events, filters and decodes them, persists per-file read
//! offsets, and hands ordered events to a host-supplied output callback.
//!
//! The host embeds [`supervisor::TailerSupervisor`], calls
//! [`supervisor::TailerSupervisor::start`] once, then polls
//! [`supervisor::TailerSupervisor::find_log_src`] on its own cadence and
//! wires each returned [`source::LogSrc`] to its sink via
//! [`source::LogSrc::set_output`].

pub mod assembler;
pub mod config;
pub mod gate;
pub mod globber;
pub mod helpers;
pub mod instrumentation;
pub mod metrics;
pub mod source;
pub mod state;
pub mod supervisor;
pub mod tailer;
