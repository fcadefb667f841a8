// External crates
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

/// One include/exclude rule evaluated against the full event message.
#[derive(Debug, Deserialize, Clone)]
pub struct EventFilter {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    pub expression: String,
    #[serde(skip)]
    regex: Option<Regex>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Include,
    Exclude,
}

impl EventFilter {
    pub fn new(kind: FilterKind, expression: &str) -> Result<Self> {
        let mut filter = Self {
            kind,
            expression: expression.to_string(),
            regex: None,
        };
        filter.init()?;
        Ok(filter)
    }

    /// Compile the expression. Called once at config validation.
    pub fn init(&mut self) -> Result<()> {
        let regex = Regex::new(&self.expression)
            .with_context(|| format!("Invalid filter expression {:?}", self.expression))?;
        self.regex = Some(regex);
        Ok(())
    }

    fn matches(&self, message: &str) -> bool {
        // init() ran at validation; an uncompiled filter matches nothing.
        self.regex
            .as_ref()
            .map(|r| r.is_match(message))
            .unwrap_or(false)
    }
}

/// An event passes the chain iff, for every filter, being an include
/// filter coincides with the regex matching. Evaluation stops at the
/// first filter that drops the event.
pub fn passes(filters: &[EventFilter], message: &str) -> bool {
    filters
        .iter()
        .all(|f| (f.kind == FilterKind::Include) == f.matches(message))
}
