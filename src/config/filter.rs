use regex::{Regex, RegexBuilder};

use crate::app::ConfigError;

/// Include/exclude title rules for one feed. Patterns are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct TitleFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TitleFilter {
    pub fn compile(
        feed: &str,
        include: &[String],
        exclude: &[String],
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            include: compile_all(feed, "include", include)?,
            exclude: compile_all(feed, "exclude", exclude)?,
        })
    }

    /// Excludes win over includes; no include rules means everything is included.
    pub fn matches(&self, title: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(title)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(title))
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

fn compile_all(
    feed: &str,
    kind: &'static str,
    patterns: &[String],
) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| ConfigError::Pattern {
                    feed: feed.to_string(),
                    kind,
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(include: &[&str], exclude: &[&str]) -> TitleFilter {
        let include: Vec<String> = include.iter().map(|s| s.to_string()).collect();
        let exclude: Vec<String> = exclude.iter().map(|s| s.to_string()).collect();
        TitleFilter::compile("test", &include, &exclude).unwrap()
    }

    #[test]
    fn test_case_insensitive_matching() {
        let f = filter(&["1080P", "CHS"], &["720p", "Eng"]);

        assert!(f.matches("[Anime] Episode 01 [1080p][chs]"));
        assert!(!f.matches("[Anime] Episode 03 [1080p][eng]"));
        assert!(!f.matches("[Anime] Episode 02 [720P]"));
    }

    #[test]
    fn test_no_include_rules_matches_all() {
        let f = filter(&[], &["Test"]);

        assert!(f.matches("Anything goes"));
        assert!(!f.matches("this is a test"));
    }

    #[test]
    fn test_empty_filter() {
        let f = TitleFilter::default();
        assert!(f.is_empty());
        assert!(f.matches("whatever"));
    }

    #[test]
    fn test_invalid_pattern_reports_feed() {
        let err = TitleFilter::compile("anime", &["[".to_string()], &[]).unwrap_err();
        assert!(err.to_string().contains("anime"));
    }
}
