//! Exclusion patterns for walked and watched paths
//!
//! Patterns use gitignore syntax. A pattern without a slash (`.git`,
//! `*.swp`) matches that name at any depth; an ignored directory hides
//! everything beneath it.

use crate::Result;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

/// Compiled exclusion patterns.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Compile `patterns`. Fails on the first invalid pattern.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::none());
        }

        let mut builder = GitignoreBuilder::new("/");
        for pattern in patterns {
            builder.add_line(None, pattern.as_ref())?;
        }
        Ok(Self {
            matcher: builder.build()?,
        })
    }

    /// Rules that ignore nothing.
    pub fn none() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_empty()
    }

    /// Check if `path` or any of its ancestors is excluded.
    pub fn should_ignore(&self, path: &Path, is_dir: bool) -> bool {
        if self.is_empty() {
            return false;
        }
        if self.matcher.matched(path, is_dir).is_ignore() {
            return true;
        }
        path.ancestors()
            .skip(1)
            .filter(|p| p.file_name().is_some())
            .any(|p| self.matcher.matched(p, true).is_ignore())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rules_ignore_nothing() {
        let rules = IgnoreRules::new::<&str>(&[]).unwrap();
        assert!(rules.is_empty());
        assert!(!rules.should_ignore(Path::new("/w/.git"), true));
    }

    #[test]
    fn test_directory_and_descendants() {
        let rules = IgnoreRules::new(&[".git", "node_modules/"]).unwrap();

        assert!(rules.should_ignore(Path::new("/w/repo/.git"), true));
        assert!(rules.should_ignore(Path::new("/w/repo/.git/objects/ab"), false));
        assert!(rules.should_ignore(Path::new("/w/node_modules/pkg/index.js"), false));
        assert!(!rules.should_ignore(Path::new("/w/src/main.rs"), false));
    }

    #[test]
    fn test_file_globs() {
        let rules = IgnoreRules::new(&["*.swp", "*~"]).unwrap();

        assert!(rules.should_ignore(Path::new("/w/src/.main.rs.swp"), false));
        assert!(rules.should_ignore(Path::new("/w/notes.txt~"), false));
        assert!(!rules.should_ignore(Path::new("/w/notes.txt"), false));
    }

    #[test]
    fn test_dir_only_pattern_skips_files() {
        let rules = IgnoreRules::new(&["build/"]).unwrap();

        assert!(rules.should_ignore(Path::new("/w/build"), true));
        assert!(!rules.should_ignore(Path::new("/w/build"), false));
    }
}
