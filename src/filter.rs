//! File filter.
//!
//! Regexes are compiled once and held pre-compiled so `is_target_file`
//! never recompiles a pattern per call.

use regex::Regex;

use crate::error::{Error, Result};

pub struct FileFilter {
    sync_only: Option<Regex>,
    sync_ignore: Option<Regex>,
}

impl FileFilter {
    pub fn new(sync_only_regex: Option<&str>, sync_ignore_regex: Option<&str>) -> Result<Self> {
        let compile = |pattern: Option<&str>| -> Result<Option<Regex>> {
            match pattern {
                Some(p) if !p.is_empty() => Regex::new(p)
                    .map(Some)
                    .map_err(|e| Error::Unclassified(format!("invalid filter regex: {e}"))),
                _ => Ok(None),
            }
        };
        Ok(Self {
            sync_only: compile(sync_only_regex)?,
            sync_ignore: compile(sync_ignore_regex)?,
        })
    }

    /// `isTargetFile(path)`:
    /// - paths containing `":"` (special namespaces) always included
    /// - `syncOnlyRegEx` set and not matching -> excluded
    /// - `syncIgnoreRegEx` set and matching -> excluded
    /// - else included
    pub fn is_target_file(&self, path: &str) -> bool {
        if path.contains(':') {
            return true;
        }
        if let Some(only) = &self.sync_only {
            if !only.is_match(path) {
                return false;
            }
        }
        if let Some(ignore) = &self.sync_ignore {
            if ignore.is_match(path) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_filters_includes_everything() {
        let f = FileFilter::new(None, None).unwrap();
        assert!(f.is_target_file("notes/a.md"));
    }

    #[test]
    fn colon_bypasses_regex_filters() {
        let f = FileFilter::new(Some("^only/"), None).unwrap();
        assert!(f.is_target_file("special:namespace/a.md"));
    }

    #[test]
    fn sync_only_excludes_non_matching() {
        let f = FileFilter::new(Some("^notes/"), None).unwrap();
        assert!(f.is_target_file("notes/a.md"));
        assert!(!f.is_target_file("other/a.md"));
    }

    #[test]
    fn sync_ignore_excludes_matching() {
        let f = FileFilter::new(None, Some("\\.tmp$")).unwrap();
        assert!(f.is_target_file("notes/a.md"));
        assert!(!f.is_target_file("notes/a.tmp"));
    }

    #[test]
    fn both_filters_compose() {
        let f = FileFilter::new(Some("^notes/"), Some("draft")).unwrap();
        assert!(f.is_target_file("notes/a.md"));
        assert!(!f.is_target_file("notes/draft-a.md"));
        assert!(!f.is_target_file("other/a.md"));
    }
}
