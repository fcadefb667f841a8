pub mod models;
pub mod platform;
pub mod reader;
pub mod tailer;
pub mod watch;
