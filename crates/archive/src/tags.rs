//! Rule-based file classification.

use crate::error::Result;
use crate::model::Tag;
use crate::pattern::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Built-in content-type rules: `(tag, patterns)`.
const DEFAULT_RULES: &[(&str, &[&str])] = &[
    ("input", &["*.nml", "*namelist*", "input/**", "*.in"]),
    ("config", &["*.yaml", "*.yml", "*.json", "*.toml", "*.cfg", "*.conf", "*.ini", "*namelist*"]),
    ("restart", &["*restart*", "*.rst", "restart/**", "*_rs_*"]),
    ("outdata", &["*.nc", "*.grb", "*.grib", "*.h5", "outdata/**", "*output*", "*results*"]),
    ("log", &["*.log", "*.out", "*.err", "log/**"]),
    ("scripts", &["*.sh", "*.py", "*.run", "scripts/**"]),
    ("viz", &["*.png", "*.jpg", "*.pdf", "*.svg", "viz/**"]),
    ("forcing", &["forcing/**", "*forcing*"]),
    ("analysis", &["analysis/**", "*_analysis*"]),
];

/// How much a file matters when deciding what to archive or keep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileImportance {
    Critical,
    Important,
    Optional,
    Temporary,
}

#[derive(Clone, Debug)]
pub struct TagRule {
    pattern: Pattern,
    tags: BTreeSet<Tag>,
}

impl TagRule {
    pub fn new(pattern: &str, tags: impl IntoIterator<Item = impl Into<Tag>>) -> Result<Self> {
        Ok(Self {
            pattern: Pattern::parse(pattern)?,
            tags: tags.into_iter().map(Into::into).collect(),
        })
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn tags(&self) -> &BTreeSet<Tag> {
        &self.tags
    }
}

/// Ordered table of classification rules.
///
/// Classification is a pure function of the path and the table: every
/// matching rule contributes its tags.
#[derive(Clone, Debug, Default)]
pub struct TagSystem {
    rules: Vec<TagRule>,
}

impl TagSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table seeded with the built-in content-type rules.
    pub fn with_default_rules() -> Self {
        let mut system = Self::new();
        for (tag, patterns) in DEFAULT_RULES {
            for pattern in *patterns {
                // Built-in globs are static and always compile.
                if let Ok(rule) = TagRule::new(pattern, [*tag]) {
                    system.rules.push(rule);
                }
            }
        }
        system
    }

    pub fn add_rule(&mut self, rule: TagRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[TagRule] {
        &self.rules
    }

    /// Union of the tags of every rule matching `path`; empty if none match.
    pub fn tag_file(&self, path: impl AsRef<Path>) -> BTreeSet<Tag> {
        let path = path.as_ref();
        self.rules
            .iter()
            .filter(|rule| rule.pattern.matches(path))
            .flat_map(|rule| rule.tags.iter().cloned())
            .collect()
    }

    /// Importance implied by a tag set; the most important tag wins.
    pub fn classify_importance(tags: &BTreeSet<Tag>) -> FileImportance {
        tags.iter()
            .map(|tag| match tag.as_str() {
                "restart" | "input" | "config" => FileImportance::Critical,
                "outdata" | "forcing" => FileImportance::Important,
                "log" => FileImportance::Temporary,
                _ => FileImportance::Optional,
            })
            .min()
            .unwrap_or(FileImportance::Optional)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tags(names: &[&str]) -> BTreeSet<Tag> {
        names.iter().map(|n| Tag::new(n)).collect()
    }

    #[rstest]
    #[case("exp01/namelist.oce", &["config", "input"])]
    #[case("exp01/restart/fesom.restart.nc", &["outdata", "restart"])]
    #[case("exp01/log/run.log", &["log"])]
    #[case("exp01/scripts/postprocess.py", &["scripts"])]
    #[case("exp01/forcing/era5_1990.grb", &["forcing", "outdata"])]
    #[case("exp01/README", &[])]
    fn test_default_rules(#[case] path: &str, #[case] expected: &[&str]) {
        let system = TagSystem::with_default_rules();
        assert_eq!(system.tag_file(path), tags(expected));
    }

    #[test]
    fn test_empty_system_never_fails() {
        assert!(TagSystem::new().tag_file("anything/at/all").is_empty());
    }

    #[test]
    fn test_add_rule_appends_and_unions() {
        let mut system = TagSystem::new();
        system.add_rule(TagRule::new("*.nc", ["outdata"]).unwrap());
        system.add_rule(TagRule::new("re:ocean", ["ocean", "Outdata"]).unwrap());
        assert_eq!(system.rules().len(), 2);
        assert_eq!(system.tag_file("exp01/ocean_1990.nc"), tags(&["ocean", "outdata"]));
        assert_eq!(system.tag_file("exp01/atmos_1990.nc"), tags(&["outdata"]));
    }

    #[test]
    fn test_classify_importance() {
        assert_eq!(TagSystem::classify_importance(&tags(&["log", "restart"])), FileImportance::Critical);
        assert_eq!(TagSystem::classify_importance(&tags(&["outdata"])), FileImportance::Important);
        assert_eq!(TagSystem::classify_importance(&tags(&["log"])), FileImportance::Temporary);
        assert_eq!(TagSystem::classify_importance(&tags(&[])), FileImportance::Optional);
    }
}
