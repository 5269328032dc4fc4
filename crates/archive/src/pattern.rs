//! Path patterns shared by tag rules, path mappings and filters.
//!
//! A pattern is either a glob or, when prefixed with `re:`, a regular
//! expression matched against the whole logical path.
//!
//! Glob rules:
//! - `*` and `?` never cross a `/`; `**` does.
//! - A glob without `/` is matched against the file name only.
//! - A glob containing `/` matches at any directory depth, unless it starts
//!   with `/`, which anchors it to the root of the logical path.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::path::Path;

const REGEX_PREFIX: &str = "re:";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    FileName,
    FullPath,
}

#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
    scope: Scope,
}

impl Pattern {
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let (expression, scope) = match source.strip_prefix(REGEX_PREFIX) {
            Some(expression) => (expression.to_string(), Scope::FullPath),
            None => glob_to_regex(&source),
        };
        let regex = Regex::new(&expression).or_raise(|| ErrorKind::InvalidPattern(source.clone()))?;
        Ok(Self { source, regex, scope })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn subject<'p>(&self, path: &'p Path) -> Option<std::borrow::Cow<'p, str>> {
        match self.scope {
            Scope::FileName => path.file_name().map(|name| name.to_string_lossy()),
            Scope::FullPath => Some(path.to_string_lossy()),
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        self.subject(path).is_some_and(|subject| self.regex.is_match(&subject))
    }

    /// Named capture groups of a successful match.
    pub fn captures(&self, path: &Path) -> Option<BTreeMap<String, String>> {
        let subject = self.subject(path)?;
        let captures = self.regex.captures(&subject)?;
        Some(
            self.regex
                .capture_names()
                .flatten()
                .filter_map(|name| captures.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect(),
        )
    }
}

impl Debug for Pattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

fn glob_to_regex(glob: &str) -> (String, Scope) {
    let (rooted, body) = match glob.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, glob),
    };
    let scope = match body.contains('/') {
        true => Scope::FullPath,
        false => Scope::FileName,
    };
    let mut expression = String::from("^");
    if scope == Scope::FullPath && !rooted {
        expression.push_str("(?:.*/)?");
    }
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    expression.push_str("(?:.*/)?");
                } else {
                    expression.push_str(".*");
                }
            },
            '*' => expression.push_str("[^/]*"),
            '?' => expression.push_str("[^/]"),
            c => expression.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expression.push('$');
    (expression, scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("*.nc", "exp01/outdata/ocean_1990.nc", true)]
    #[case("*.nc", "exp01/outdata/ocean_1990.nc.bak", false)]
    #[case("*restart*", "exp01/restart/fesom.restart.oce.nc", true)]
    #[case("restart/**", "exp01/restart/2000/fesom.nc", true)]
    #[case("restart/**", "exp01/restarts/fesom.nc", false)]
    #[case("/restart/**", "exp01/restart/fesom.nc", false)]
    #[case("/restart/**", "restart/fesom.nc", true)]
    #[case("exp??/*.log", "exp01/run.log", true)]
    #[case("exp??/*.log", "exp01/log/run.log", false)]
    #[case("**/log/*.log", "a/b/log/run.log", true)]
    #[case("**/log/*.log", "log/run.log", true)]
    #[case("ocean[1].nc", "ocean[1].nc", true)]
    #[case("re:^exp\\d+/outdata/.*\\.grb$", "exp42/outdata/atm.grb", true)]
    #[case("re:^exp\\d+/outdata/.*\\.grb$", "exp42/input/atm.grb", false)]
    fn test_matches(#[case] pattern: &str, #[case] path: &str, #[case] expected: bool) {
        let pattern = Pattern::parse(pattern).unwrap();
        assert_eq!(pattern.matches(Path::new(path)), expected, "{pattern:?} vs {path}");
    }

    #[test]
    fn test_captures() {
        let pattern = Pattern::parse("re:^(?P<experiment>[^/]+)/outdata/(?P<year>\\d{4})/").unwrap();
        let captures = pattern.captures(Path::new("exp01/outdata/1990/ocean.nc")).unwrap();
        assert_eq!(captures["experiment"], "exp01");
        assert_eq!(captures["year"], "1990");
        assert!(pattern.captures(Path::new("exp01/input/ocean.nc")).is_none());
    }

    #[test]
    fn test_invalid_regex() {
        let err = Pattern::parse("re:(unclosed").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPattern(_)));
    }
}
