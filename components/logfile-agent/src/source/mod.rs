pub mod events;
pub mod tailersrc;

pub use events::{LogEvent, LogRecord, LogSrc, OutputFn, SourceDescriptors};
