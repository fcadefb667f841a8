// Local crates
use crate::config::filters::EventFilter;
use crate::config::timestamp::{EventTimezone, TimestampExtractor, resolve_timezone};

// External crates
use anyhow::{Context, Result, bail};
use encoding_rs::Encoding;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

/// Default cap on a single assembled event, in bytes.
pub const DEFAULT_MAX_EVENT_SIZE: usize = 256 * 1024;

/// Literal appended after trimming an oversized event.
pub const DEFAULT_TRUNCATE_SUFFIX: &str = "[Truncated...]";

/// Multi-line start applied when no pattern is configured: any line
/// that begins with a non-whitespace character starts a new event.
pub const DEFAULT_MULTILINE_START: &str = r"^\S";

/// Sentinel that aliases the multi-line start pattern to the timestamp
/// regex.
pub const MULTILINE_TIMESTAMP_SENTINEL: &str = "{timestamp_regex}";

/// How the per-tailer gate reacts to a saturated sink.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Block on the line queue; the file handle stays open.
    #[default]
    Buffer,
    /// Release the file descriptor while the sink is stalled.
    FdRelease,
}

/// One configured tailing target. Built by the host (or
/// [`crate::helpers::load_config::AgentConfig`]), validated once via
/// [`FileConfig::init`], immutable afterwards.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    /// Glob pattern selecting the file(s) to tail.
    pub file_path: String,
    /// Regex; matching paths are never tailed.
    pub blacklist: Option<String>,
    /// Tail every matching path instead of only the most recently
    /// modified one.
    #[serde(default)]
    pub publish_multi_logs: bool,
    /// Delete a rotated file once it has been fully read.
    #[serde(default)]
    pub auto_removal: bool,
    /// With no saved offset, read from the start instead of the end.
    #[serde(default)]
    pub from_beginning: bool,
    /// The target is a named pipe: no seeking, no change watcher.
    #[serde(default)]
    pub pipe: bool,
    /// IANA/HTML charset name; unset means UTF-8.
    pub encoding: Option<String>,
    /// Destination label passed through to the sink.
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub log_group_name: String,
    #[serde(default)]
    pub log_stream_name: String,
    #[serde(default)]
    pub log_group_class: String,
    /// Informational; forwarded to the sink untouched.
    #[serde(default = "default_retention")]
    pub retention_in_days: i64,
    /// Optional entity descriptor forwarded to the sink.
    pub entity: Option<String>,
    /// Regex locating the timestamp inside an event.
    pub timestamp_regex: Option<String>,
    /// strftime layouts tried in order against the regex match.
    #[serde(default)]
    pub timestamp_layout: Vec<String>,
    /// `"UTC"` (exactly) or anything else for the host's local zone.
    pub timezone: Option<String>,
    /// Regex classifying a line as the start of a new event. Unset (or
    /// empty) applies the non-whitespace default;
    /// `{timestamp_regex}` aliases the timestamp regex.
    pub multi_line_start_pattern: Option<String>,
    /// Flush cadence for a partially assembled multi-line event.
    #[serde(default = "default_multiline_wait_ms")]
    pub multi_line_wait_period_ms: u64,
    #[serde(default)]
    pub filters: Vec<EventFilter>,
    #[serde(default = "default_max_event_size")]
    pub max_event_size: usize,
    #[serde(default = "default_truncate_suffix")]
    pub truncate_suffix: String,
    #[serde(default)]
    pub backpressure_mode: BackpressureMode,

    // Compiled at init(); never serialized.
    #[serde(skip)]
    pub blacklist_regex: Option<Regex>,
    #[serde(skip)]
    pub timestamp_extractor: Option<TimestampExtractor>,
    #[serde(skip)]
    pub multi_line_start: Option<Arc<Regex>>,
    #[serde(skip)]
    pub enc: Option<&'static Encoding>,
    #[serde(skip)]
    pub utf16: bool,
    #[serde(skip)]
    pub tz: EventTimezone,
}

fn default_retention() -> i64 {
    -1
}

fn default_multiline_wait_ms() -> u64 {
    1000
}

fn default_max_event_size() -> usize {
    DEFAULT_MAX_EVENT_SIZE
}

fn default_truncate_suffix() -> String {
    DEFAULT_TRUNCATE_SUFFIX.to_string()
}

impl FileConfig {
    /// Validate and compile the record. Any failure here is fatal to
    /// supervisor start.
    pub fn init(&mut self) -> Result<()> {
        if self.file_path.is_empty() {
            bail!("file_path must not be empty");
        }

        if let Some(pattern) = &self.blacklist {
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid blacklist regex {:?}", pattern))?;
            self.blacklist_regex = Some(regex);
        }

        if let Some(name) = &self.encoding {
            let enc = Encoding::for_label(name.trim().as_bytes())
                .with_context(|| format!("Unknown encoding {:?}", name))?;
            self.utf16 = enc == encoding_rs::UTF_16LE || enc == encoding_rs::UTF_16BE;
            self.enc = Some(enc);
        }

        self.tz = resolve_timezone(self.timezone.as_deref());

        if let Some(pattern) = &self.timestamp_regex {
            let extractor = TimestampExtractor::new(
                pattern,
                self.timestamp_layout.clone(),
                self.tz,
            )?;
            self.timestamp_extractor = Some(extractor);
        }

        self.multi_line_start = match self.multi_line_start_pattern.as_deref() {
            None | Some("") => Some(Arc::new(
                Regex::new(DEFAULT_MULTILINE_START).expect("default pattern compiles"),
            )),
            Some(MULTILINE_TIMESTAMP_SENTINEL) => {
                let extractor = self.timestamp_extractor.as_ref().context(
                    "multi_line_start_pattern aliases the timestamp regex, but no \
                     timestamp_regex is configured",
                )?;
                Some(extractor.regex())
            }
            Some(pattern) => {
                let regex = Regex::new(pattern)
                    .with_context(|| format!("Invalid multi_line_start_pattern {:?}", pattern))?;
                Some(Arc::new(regex))
            }
        };

        for filter in &mut self.filters {
            filter.init()?;
        }

        if self.max_event_size == 0 {
            self.max_event_size = DEFAULT_MAX_EVENT_SIZE;
        }
        if self.truncate_suffix.is_empty() {
            self.truncate_suffix = DEFAULT_TRUNCATE_SUFFIX.to_string();
        }
        if self.multi_line_wait_period_ms == 0 {
            self.multi_line_wait_period_ms = default_multiline_wait_ms();
        }
        if self.max_event_size <= self.truncate_suffix.len() {
            bail!(
                "max_event_size ({}) must exceed the truncation suffix length ({})",
                self.max_event_size,
                self.truncate_suffix.len()
            );
        }

        if self.log_group_name.is_empty() {
            self.log_group_name = self.file_path.clone();
        }
        if self.log_stream_name.is_empty() {
            self.log_stream_name = self.file_path.clone();
        }

        Ok(())
    }

    pub fn blacklisted(&self, name: &str) -> bool {
        self.blacklist_regex
            .as_ref()
            .map(|r| r.is_match(name))
            .unwrap_or(false)
    }

    pub fn timestamp_extractor(&self) -> Option<&TimestampExtractor> {
        self.timestamp_extractor.as_ref()
    }

    pub fn multi_line_start(&self) -> Option<Arc<Regex>> {
        self.multi_line_start.clone()
    }

    /// Resolved encoding; `None` means plain UTF-8.
    pub fn encoding(&self) -> Option<&'static Encoding> {
        self.enc
    }

    /// Whether lines are framed as UTF-16 (`\n\0` terminator).
    pub fn is_utf16(&self) -> bool {
        self.utf16
    }

    pub fn event_timezone(&self) -> EventTimezone {
        self.tz
    }

    /// FD-release gating applies only when rotation cleanup is not
    /// already racing the reopen.
    pub fn fd_release_enabled(&self) -> bool {
        self.backpressure_mode == BackpressureMode::FdRelease && !self.auto_removal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::filters::FilterKind;

    fn base() -> FileConfig {
        FileConfig {
            file_path: "/var/log/app.log".to_string(),
            max_event_size: default_max_event_size(),
            truncate_suffix: default_truncate_suffix(),
            multi_line_wait_period_ms: default_multiline_wait_ms(),
            retention_in_days: default_retention(),
            ..FileConfig::default()
        }
    }

    #[test]
    fn defaults_applied_on_init() {
        let mut cfg = base();
        cfg.init().unwrap();
        assert_eq!(cfg.max_event_size, DEFAULT_MAX_EVENT_SIZE);
        assert_eq!(cfg.truncate_suffix, DEFAULT_TRUNCATE_SUFFIX);
        assert_eq!(cfg.log_group_name, "/var/log/app.log");
        assert!(!cfg.is_utf16());
    }

    #[test]
    fn unset_pattern_selects_nonwhitespace_default() {
        let mut cfg = base();
        assert_eq!(cfg.multi_line_start_pattern, None);
        cfg.init().unwrap();
        let m = cfg.multi_line_start().unwrap();
        assert!(m.is_match("header line"));
        assert!(!m.is_match("  continuation"));
    }

    #[test]
    fn empty_pattern_selects_nonwhitespace_default() {
        let mut cfg = base();
        cfg.multi_line_start_pattern = Some(String::new());
        cfg.init().unwrap();
        let m = cfg.multi_line_start().unwrap();
        assert!(m.is_match("header line"));
        assert!(!m.is_match("  continuation"));
    }

    #[test]
    fn sentinel_aliases_timestamp_regex() {
        let mut cfg = base();
        cfg.timestamp_regex = Some(r"\d{4}-\d{2}-\d{2}".to_string());
        cfg.timestamp_layout = vec!["%Y-%m-%d".to_string()];
        cfg.multi_line_start_pattern = Some(MULTILINE_TIMESTAMP_SENTINEL.to_string());
        cfg.init().unwrap();

        let aliased = cfg.multi_line_start().unwrap();
        let original = cfg.timestamp_extractor().unwrap().regex();
        assert!(Arc::ptr_eq(&aliased, &original));
    }

    #[test]
    fn sentinel_without_timestamp_regex_is_an_error() {
        let mut cfg = base();
        cfg.multi_line_start_pattern = Some(MULTILINE_TIMESTAMP_SENTINEL.to_string());
        assert!(cfg.init().is_err());
    }

    #[test]
    fn bad_regexes_fail_init() {
        let mut cfg = base();
        cfg.blacklist = Some("(".to_string());
        assert!(cfg.init().is_err());

        let mut cfg = base();
        cfg.multi_line_start_pattern = Some("[".to_string());
        assert!(cfg.init().is_err());
    }

    #[test]
    fn unknown_encoding_fails_init() {
        let mut cfg = base();
        cfg.encoding = Some("klingon-8".to_string());
        assert!(cfg.init().is_err());
    }

    #[test]
    fn utf16_aliases_resolve() {
        for name in ["utf-16", "UTF-16LE", "utf-16be"] {
            let mut cfg = base();
            cfg.encoding = Some(name.to_string());
            cfg.init().unwrap();
            assert!(cfg.is_utf16(), "{name} should select UTF-16 framing");
        }

        let mut cfg = base();
        cfg.encoding = Some("latin1".to_string());
        cfg.init().unwrap();
        assert!(!cfg.is_utf16());
        assert_eq!(cfg.encoding().unwrap(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn tiny_max_event_size_rejected() {
        let mut cfg = base();
        cfg.max_event_size = 4;
        assert!(cfg.init().is_err());
    }

    #[test]
    fn filters_compiled_by_init() {
        let mut cfg = base();
        cfg.filters = vec![EventFilter::new(FilterKind::Include, "ERROR").unwrap()];
        cfg.init().unwrap();
        assert!(crate::config::filters::passes(&cfg.filters, "ERROR boom"));
    }

    #[test]
    fn fd_release_disabled_under_auto_removal() {
        let mut cfg = base();
        cfg.backpressure_mode = BackpressureMode::FdRelease;
        cfg.init().unwrap();
        assert!(cfg.fd_release_enabled());

        cfg.auto_removal = true;
        assert!(!cfg.fd_release_enabled());
    }
}
