//! Per-cycle target selection for one config.

// Local crates
use crate::config::file_config::FileConfig;
use crate::globber::globber::{GlobMatcher, TargetFile};

// External crates
use std::path::Path;

/// Archive suffixes that are never tailed.
pub const COMPRESSED_SUFFIXES: &[&str] = &["gz", "zip", "tar", "bz2", "zst", "rar"];

/// Expand the config's pattern and drop everything that must not be
/// tailed: paths inside the state directory, directories (symlinks
/// resolved), compressed archives, and blacklist matches. Unless
/// `publish_multi_logs` is set, only the most recently modified match
/// survives.
pub fn discover(config: &FileConfig, matcher: &GlobMatcher, state_dir: &Path) -> Vec<TargetFile> {
    let candidates: Vec<TargetFile> = matcher
        .matches()
        .into_values()
        .filter(|target| keep(config, target, state_dir))
        .collect();

    if config.publish_multi_logs {
        candidates
    } else {
        candidates
            .into_iter()
            .max_by_key(|target| target.modified)
            .into_iter()
            .collect()
    }
}

fn keep(config: &FileConfig, target: &TargetFile, state_dir: &Path) -> bool {
    if target.path.starts_with(state_dir) {
        return false;
    }
    if target.is_dir {
        tracing::debug!(
            path = %target.path.display(),
            "Skipping directory matched by pattern"
        );
        return false;
    }

    let extension = target
        .path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    if let Some(ext) = extension {
        if COMPRESSED_SUFFIXES.contains(&ext.as_str()) {
            tracing::debug!(
                path = %target.path.display(),
                "Skipping compressed archive"
            );
            return false;
        }
    }

    if let Some(name) = target.path.file_name().and_then(|n| n.to_str()) {
        if config.blacklisted(name) {
            tracing::debug!(
                path = %target.path.display(),
                "Skipping blacklisted file"
            );
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn config(pattern: &str) -> (FileConfig, GlobMatcher) {
        let mut cfg = FileConfig {
            file_path: pattern.to_string(),
            max_event_size: 1024,
            truncate_suffix: "[Truncated...]".to_string(),
            ..FileConfig::default()
        };
        cfg.init().unwrap();
        let matcher = GlobMatcher::compile(pattern).unwrap();
        (cfg, matcher)
    }

    #[test]
    fn compressed_and_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.log"), b"x").unwrap();
        fs::write(dir.path().join("a.log.gz"), b"x").unwrap();
        fs::write(dir.path().join("b.zip"), b"x").unwrap();
        fs::create_dir(dir.path().join("c.log.d")).unwrap();

        let (mut cfg, matcher) = config(&format!("{}/*", dir.path().display()));
        cfg.publish_multi_logs = true;

        let state_dir = PathBuf::from("/nonexistent-state");
        let found = discover(&cfg, &matcher, &state_dir);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, dir.path().join("a.log"));
    }

    #[test]
    fn state_dir_contents_are_never_tailed() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        fs::create_dir(&state_dir).unwrap();
        fs::write(state_dir.join("x.log"), b"x").unwrap();
        fs::write(dir.path().join("y.log"), b"x").unwrap();

        let (mut cfg, matcher) = config(&format!("{}/**/*.log", dir.path().display()));
        cfg.publish_multi_logs = true;

        let found = discover(&cfg, &matcher, &state_dir);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, dir.path().join("y.log"));
    }

    #[test]
    fn blacklist_matches_file_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.log"), b"x").unwrap();
        fs::write(dir.path().join("app.log.bak"), b"x").unwrap();

        let (mut cfg, matcher) = config(&format!("{}/*", dir.path().display()));
        cfg.publish_multi_logs = true;
        cfg.blacklist = Some(r"\.bak$".to_string());
        cfg.init().unwrap();

        let found = discover(&cfg, &matcher, &PathBuf::from("/none"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, dir.path().join("app.log"));
    }

    #[test]
    fn latest_modified_wins_without_publish_multi_logs() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("old.log");
        let newer = dir.path().join("new.log");
        fs::write(&older, b"x").unwrap();
        fs::write(&newer, b"x").unwrap();

        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let file = fs::File::options().write(true).open(&older).unwrap();
        file.set_modified(past).unwrap();
        drop(file);

        let (cfg, matcher) = config(&format!("{}/*.log", dir.path().display()));
        let found = discover(&cfg, &matcher, &PathBuf::from("/none"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, newer);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_to_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("real_dir")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real_dir"), dir.path().join("link.log"))
            .unwrap();
        fs::write(dir.path().join("plain.log"), b"x").unwrap();

        let (mut cfg, matcher) = config(&format!("{}/*.log", dir.path().display()));
        cfg.publish_multi_logs = true;

        let found = discover(&cfg, &matcher, &PathBuf::from("/none"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, dir.path().join("plain.log"));
    }
}
