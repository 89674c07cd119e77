//! Per-file eligibility for completions.
//!
//! Checks run in a fixed order: ignore globs on the path, then ignored
//! tags, then the allowed-folder restriction. The first failing check
//! decides the verdict.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use crate::settings::SettingsError;

/// The file currently open in the editor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    /// Vault-relative path, `/`-separated.
    pub path: String,
    /// Tags as written in the file, with or without the leading `#`.
    pub tags: Vec<String>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Include/exclude glob matcher for ignored file patterns.
///
/// Patterns starting with `!` are exclusions: a path is ignored when it
/// matches at least one inclusion and no exclusion. Blank patterns are
/// skipped; no patterns means nothing is ignored.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, SettingsError> {
        let mut include = GlobSetBuilder::new();
        let mut exclude = GlobSetBuilder::new();

        for raw in patterns {
            let pattern = raw.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            let (target, glob) = match pattern.strip_prefix('!') {
                Some(rest) => (&mut exclude, rest),
                None => (&mut include, pattern),
            };
            let compiled = GlobBuilder::new(glob)
                .literal_separator(true)
                .build()
                .map_err(|e| SettingsError::InvalidIgnorePattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })?;
            target.add(compiled);
        }

        let build = |builder: GlobSetBuilder| {
            builder.build().map_err(|e| SettingsError::InvalidIgnorePattern {
                pattern: patterns
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join("\n"),
                reason: e.to_string(),
            })
        };

        Ok(Self {
            include: build(include)?,
            exclude: build(exclude)?,
        })
    }

    pub fn empty() -> Self {
        Self {
            include: GlobSet::empty(),
            exclude: GlobSet::empty(),
        }
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.include.is_match(path) && !self.exclude.is_match(path)
    }
}

impl Default for PathMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

/// Verdict for the current file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Path matches an ignore glob; triggering is suppressed.
    IgnoredPath,
    /// File carries an ignored tag; triggering is suppressed.
    IgnoredTag,
    /// File lies outside the allowed folder; completions are disabled
    /// for the file and the backend connection is released.
    OutsideAllowedFolder,
}

impl Eligibility {
    /// Evaluate the checks in order. No open file is always eligible.
    pub fn evaluate(
        file: Option<&FileInfo>,
        ignored_paths: &PathMatcher,
        ignored_tags: &[String],
        allowed_folder: Option<&str>,
    ) -> Self {
        let Some(file) = file else {
            return Self::Eligible;
        };

        if ignored_paths.is_match(&file.path) {
            return Self::IgnoredPath;
        }
        if has_ignored_tag(&file.tags, ignored_tags) {
            return Self::IgnoredTag;
        }
        if let Some(folder) = allowed_folder {
            if !is_within_folder(&file.path, folder) {
                return Self::OutsideAllowedFolder;
            }
        }
        Self::Eligible
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().replace('#', "").to_lowercase()
}

fn has_ignored_tag(file_tags: &[String], ignored_tags: &[String]) -> bool {
    let ignored: Vec<String> = ignored_tags
        .iter()
        .map(|t| normalize_tag(t))
        .filter(|t| !t.is_empty())
        .collect();
    if ignored.is_empty() {
        return false;
    }
    file_tags
        .iter()
        .map(|t| normalize_tag(t))
        .any(|t| ignored.contains(&t))
}

/// Whether `path` lies inside `folder`. The root folder `/` and the empty
/// string contain everything.
pub fn is_within_folder(path: &str, folder: &str) -> bool {
    let folder = folder.trim_end_matches('/');
    if folder.is_empty() {
        return true;
    }
    path.strip_prefix(folder)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> PathMatcher {
        PathMatcher::new(patterns).unwrap()
    }

    #[test]
    fn test_secret_folder_ignored() {
        let m = matcher(&["**/secret/**"]);
        assert!(m.is_match("notes/secret/plan.md"));
        assert!(m.is_match("secret/plan.md"));
        assert!(!m.is_match("notes/public/plan.md"));
    }

    #[test]
    fn test_exclusion_pattern() {
        let m = matcher(&["drafts/**", "!drafts/keep.md"]);
        assert!(m.is_match("drafts/tmp.md"));
        assert!(!m.is_match("drafts/keep.md"));
    }

    #[test]
    fn test_star_does_not_cross_separator() {
        let m = matcher(&["*.md"]);
        assert!(m.is_match("top.md"));
        assert!(!m.is_match("dir/nested.md"));
    }

    #[test]
    fn test_blank_patterns_match_nothing() {
        let m = matcher(&["", "   "]);
        assert!(!m.is_match("anything.md"));
        assert!(!PathMatcher::empty().is_match("anything.md"));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(matches!(
            PathMatcher::new(&["a/[b"]),
            Err(SettingsError::InvalidIgnorePattern { .. })
        ));
    }

    #[test]
    fn test_no_file_is_eligible() {
        let v = Eligibility::evaluate(None, &matcher(&["**"]), &[], Some("allowed"));
        assert_eq!(v, Eligibility::Eligible);
    }

    #[test]
    fn test_ignored_tag_case_insensitive() {
        let file = FileInfo::new("a.md").with_tags(["#Private"]);
        let v = Eligibility::evaluate(Some(&file), &PathMatcher::empty(), &["private".into()], None);
        assert_eq!(v, Eligibility::IgnoredTag);
    }

    #[test]
    fn test_allowed_folder() {
        let inside = FileInfo::new("work/notes/a.md");
        let outside = FileInfo::new("workshop/a.md");
        let m = PathMatcher::empty();
        assert_eq!(
            Eligibility::evaluate(Some(&inside), &m, &[], Some("work")),
            Eligibility::Eligible
        );
        assert_eq!(
            Eligibility::evaluate(Some(&outside), &m, &[], Some("work")),
            Eligibility::OutsideAllowedFolder
        );
        assert!(is_within_folder("anything.md", "/"));
    }

    #[test]
    fn test_check_order_path_before_folder() {
        let file = FileInfo::new("secret/a.md").with_tags(["private"]);
        let v = Eligibility::evaluate(
            Some(&file),
            &matcher(&["secret/**"]),
            &["private".into()],
            Some("elsewhere"),
        );
        assert_eq!(v, Eligibility::IgnoredPath);
    }
}
