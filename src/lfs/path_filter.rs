//! Include/exclude filtering of pathnames for smudge.

use crate::error::{FilterError, Result};
use glob::{MatchOptions, Pattern};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
    raw: String,
    pattern: Pattern,
}

impl Rule {
    fn new(raw: &str) -> Result<Self> {
        let pattern = Pattern::new(raw)
            .map_err(|e| FilterError::Config(format!("invalid path pattern {:?}: {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            pattern,
        })
    }

    fn matches(&self, path: &str) -> bool {
        if self.pattern.matches_with(path, MATCH_OPTIONS) {
            return true;
        }
        // Plain names also match everything below them.
        let dir = self.raw.trim_end_matches('/');
        !dir.is_empty()
            && !dir.contains(['*', '?', '['])
            && path
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

/// An empty include list matches everything; exclude always wins.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<Rule>,
    exclude: Vec<Rule>,
}

impl PathFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self> {
        Ok(Self {
            include: include.iter().map(|p| Rule::new(p.as_ref())).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| Rule::new(p.as_ref())).collect::<Result<_>>()?,
        })
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.exclude.iter().any(|r| r.matches(path)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|r| r.matches(path))
    }
}
