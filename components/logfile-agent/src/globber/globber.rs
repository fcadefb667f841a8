//! Pattern expansion for tailing targets.
//!
//! Three tiers, decided at compile time: a literal path is stat'd, a
//! pattern with only ordinary meta (`*`, `?`, `[`) is delegated to the
//! platform glob, and a pattern with super meta (`**`, `{}`, `!`) walks
//! the deepest literal directory prefix and matches every encountered
//! path against the compiled pattern.

// Local crates
use crate::tailer::platform::FileIdentity;

// External crates
use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

/// A path that matched a pattern during one discovery cycle, with the
/// metadata the supervisor needs to pick and open it.
#[derive(Debug, Clone)]
pub struct TargetFile {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
    pub identity: FileIdentity,
    pub is_dir: bool,
}

impl TargetFile {
    /// Stat `path`, following symlinks, so a symlink to a directory is
    /// reported as a directory.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
            identity: FileIdentity::of(&meta),
            is_dir: meta.is_dir(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaLevel {
    None,
    Basic,
    Super,
}

#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    meta: MetaLevel,
    /// Brace alternation expanded; one entry when no braces.
    alternatives: Vec<String>,
    compiled: Vec<Pattern>,
    /// Deepest directory prefix containing no meta characters; the walk
    /// root for super patterns.
    walk_root: PathBuf,
}

const BASIC_META: &[char] = &['*', '?', '['];

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        // Keep `*` within one path component so only `**` spans
        // separators.
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Expand `{a,b}` alternation (nesting supported) into plain patterns.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };

    let bytes = pattern.as_bytes();
    let mut depth = 0usize;
    let mut close = None;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        // Unbalanced brace: treat literally.
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let body = &pattern[open + 1..close];
    let suffix = &pattern[close + 1..];

    let mut alternatives = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, b) in body.bytes().enumerate() {
        match b {
            b'{' => depth += 1,
            b'}' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                alternatives.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    alternatives.push(&body[start..]);

    alternatives
        .into_iter()
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

fn classify(pattern: &str) -> MetaLevel {
    if pattern.contains("**") || pattern.contains('{') || pattern.contains('!') {
        MetaLevel::Super
    } else if pattern.contains(BASIC_META) {
        MetaLevel::Basic
    } else {
        MetaLevel::None
    }
}

/// Longest leading run of components free of meta characters.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        match component {
            Component::Normal(part) => {
                let part_str = part.to_string_lossy();
                if part_str.contains(BASIC_META) || part_str.contains(['{', '}', '!']) {
                    break;
                }
                prefix.push(part);
            }
            other => prefix.push(other.as_os_str()),
        }
    }
    if prefix.as_os_str().is_empty() {
        prefix.push(".");
    }
    prefix
}

impl GlobMatcher {
    pub fn compile(pattern: &str) -> Result<Self> {
        // On Windows the backslash separates paths; escape-normalize it
        // to the forward slash before the glob syntax sees it.
        #[cfg(windows)]
        let pattern = pattern.replace('\\', "/");
        #[cfg(windows)]
        let pattern = pattern.as_str();

        let meta = classify(pattern);
        let alternatives = expand_braces(pattern);
        let compiled = alternatives
            .iter()
            .map(|alt| {
                Pattern::new(alt).with_context(|| format!("Invalid file_path pattern {:?}", alt))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            pattern: pattern.to_string(),
            meta,
            alternatives,
            compiled,
            walk_root: literal_prefix(pattern),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Expand the pattern against the current filesystem state.
    ///
    /// Stat failures on individual candidates are logged and skipped;
    /// only compilation can fail.
    pub fn matches(&self) -> HashMap<PathBuf, TargetFile> {
        let mut found = HashMap::new();

        match self.meta {
            MetaLevel::None => {
                self.collect(Path::new(&self.pattern), &mut found);
            }
            MetaLevel::Basic => {
                for alternative in &self.alternatives {
                    let paths = match glob::glob_with(alternative, match_options()) {
                        Ok(paths) => paths,
                        Err(e) => {
                            tracing::debug!(
                                pattern = %alternative,
                                error = %e,
                                "Glob expansion failed"
                            );
                            continue;
                        }
                    };
                    for path in paths.flatten() {
                        self.collect(&path, &mut found);
                    }
                }
            }
            MetaLevel::Super => {
                for entry in WalkDir::new(&self.walk_root)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    let path = entry.path();
                    let matched = self
                        .compiled
                        .iter()
                        .any(|p| p.matches_path_with(path, match_options()));
                    if matched {
                        self.collect(path, &mut found);
                    }
                }
            }
        }

        found
    }

    fn collect(&self, path: &Path, found: &mut HashMap<PathBuf, TargetFile>) {
        match TargetFile::from_path(path) {
            Ok(target) => {
                found.insert(target.path.clone(), target);
            }
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %e,
                    "Skipping matched path, metadata unreadable"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn literal_path_matches_itself_only() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("app.log");
        touch(&file);

        let m = GlobMatcher::compile(file.to_str().unwrap()).unwrap();
        let found = m.matches();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&file));
    }

    #[test]
    fn missing_literal_path_matches_nothing() {
        let m = GlobMatcher::compile("/no/such/file.log").unwrap();
        assert!(m.matches().is_empty());
    }

    #[test]
    fn star_stays_within_a_component() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.log"));
        touch(&dir.path().join("b.txt"));
        touch(&dir.path().join("sub/c.log"));

        let m =
            GlobMatcher::compile(&format!("{}/*.log", dir.path().display())).unwrap();
        let found = m.matches();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&dir.path().join("a.log")));
    }

    #[test]
    fn super_asterisk_spans_directories() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a.log"));
        touch(&dir.path().join("x/b.log"));
        touch(&dir.path().join("x/y/c.log"));
        touch(&dir.path().join("x/y/d.txt"));

        let m =
            GlobMatcher::compile(&format!("{}/**/*.log", dir.path().display())).unwrap();
        let found = m.matches();
        assert_eq!(found.len(), 3, "{found:?}");
    }

    #[test]
    fn brace_alternation_expands() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("app.log"));
        touch(&dir.path().join("app.err"));
        touch(&dir.path().join("app.out"));

        let m =
            GlobMatcher::compile(&format!("{}/app.{{log,err}}", dir.path().display())).unwrap();
        let found = m.matches();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key(&dir.path().join("app.log")));
        assert!(found.contains_key(&dir.path().join("app.err")));
    }

    #[test]
    fn bracket_negation_matches() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a1.log"));
        touch(&dir.path().join("a2.log"));

        let m =
            GlobMatcher::compile(&format!("{}/a[!2].log", dir.path().display())).unwrap();
        let found = m.matches();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&dir.path().join("a1.log")));
    }

    #[test]
    fn invalid_pattern_fails_compile() {
        assert!(GlobMatcher::compile("/var/log/[").is_err());
    }

    #[test]
    fn directories_are_reported_as_such() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("sub/a.log"));

        let m = GlobMatcher::compile(&format!("{}/*", dir.path().display())).unwrap();
        let found = m.matches();
        let sub = found.get(&dir.path().join("sub")).unwrap();
        assert!(sub.is_dir);
    }
}
