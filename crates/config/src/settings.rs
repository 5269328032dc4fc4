use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tellus_archive::{PathMapper, PathMapping, TagRule, TagSystem};
use tellus_cache::CacheConfig;
use tellus_compress::{Compression, CompressionLevel};
use tellus_storage::LocationConfig;

/// Complete configuration of one tellus process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub archive: ArchiveSettings,
    pub tags: TagSettings,
    pub path_mappings: Vec<MappingSettings>,
    pub locations: Vec<LocationConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::new(default_cache_dir()),
            archive: ArchiveSettings::default(),
            tags: TagSettings::default(),
            path_mappings: Vec::new(),
            locations: Vec::new(),
        }
    }
}

/// Defaults applied when creating archives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    pub compression: Compression,
    pub level: CompressionLevel,
    /// Location new containers are written to unless a request names one.
    pub destination: Option<String>,
    /// Write `<archive_id>.manifest.json` next to every container.
    pub write_sidecar: bool,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            compression: Compression::Gzip,
            level: CompressionLevel::Balanced,
            destination: None,
            write_sidecar: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSettings {
    /// Start from the built-in content-type rules.
    pub use_defaults: bool,
    /// Extra rules, applied after the built-in ones.
    pub rules: Vec<TagRuleSettings>,
}

impl Default for TagSettings {
    fn default() -> Self {
        Self {
            use_defaults: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRuleSettings {
    pub pattern: String,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingSettings {
    #[serde(flatten)]
    pub mapping: PathMapping,
    #[serde(default)]
    pub priority: i32,
}

fn default_cache_dir() -> PathBuf {
    match crate::project_dirs() {
        Some(dirs) => dirs.cache_dir().to_path_buf(),
        None => std::env::temp_dir().join("tellus-cache"),
    }
}

impl Config {
    pub fn location(&self, name: &str) -> Option<&LocationConfig> {
        self.locations.iter().find(|l| l.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache
            .validate()
            .or_raise(|| ErrorKind::Invalid("cache settings".to_string()))?;
        let mut names = HashSet::new();
        for location in &self.locations {
            if !names.insert(location.name.as_str()) {
                exn::bail!(ErrorKind::Invalid(format!("duplicate location {:?}", location.name)));
            }
        }
        for mapping in &self.path_mappings {
            if !names.contains(mapping.mapping.location.as_str()) {
                exn::bail!(ErrorKind::Invalid(format!(
                    "path mapping {:?} refers to unknown location {:?}",
                    mapping.mapping.pattern, mapping.mapping.location
                )));
            }
        }
        if let Some(destination) = &self.archive.destination
            && !names.contains(destination.as_str())
        {
            exn::bail!(ErrorKind::Invalid(format!("unknown archive destination {destination:?}")));
        }
        Ok(())
    }

    /// Build the classification table: built-in rules (unless disabled)
    /// followed by configured ones.
    pub fn tag_system(&self) -> Result<TagSystem> {
        let mut system = match self.tags.use_defaults {
            true => TagSystem::with_default_rules(),
            false => TagSystem::new(),
        };
        for rule in &self.tags.rules {
            let rule = TagRule::new(&rule.pattern, rule.tags.iter().map(String::as_str))
                .or_raise(|| ErrorKind::Invalid(format!("tag rule {:?}", rule.pattern)))?;
            system.add_rule(rule);
        }
        Ok(system)
    }

    /// Compile every configured mapping. Locations without an explicit
    /// mapping get an identity mapping at the lowest priority.
    pub fn path_mapper(&self) -> Result<PathMapper> {
        let mut mapper = PathMapper::new();
        for settings in &self.path_mappings {
            mapper
                .register_mapping(settings.mapping.clone(), settings.priority)
                .or_raise(|| ErrorKind::Invalid(format!("path mapping {:?}", settings.mapping.pattern)))?;
        }
        for location in &self.locations {
            mapper
                .register_mapping(PathMapping::identity(&location.name), i32::MIN)
                .or_raise(|| ErrorKind::Invalid(format!("identity mapping for {:?}", location.name)))?;
        }
        Ok(mapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tellus_storage::LocationKind;

    fn config() -> Config {
        Config {
            locations: vec![
                LocationConfig::new("work", LocationKind::Disk, "/work"),
                LocationConfig::new("hsm", LocationKind::Tape, "/hsm").with_path_prefix("ab0123"),
            ],
            path_mappings: vec![MappingSettings {
                mapping: PathMapping::new("*.nc", "hsm", "{{ prefix }}/{{ path }}"),
                priority: 5,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
        config().validate().unwrap();
    }

    #[test]
    fn test_unknown_mapping_location() {
        let mut config = config();
        config.path_mappings[0].mapping.location = "scratch".to_string();
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_duplicate_location() {
        let mut config = config();
        config.locations.push(LocationConfig::new("work", LocationKind::Compute, "/scratch"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_path_mapper_falls_back_to_identity() {
        let config = config();
        let mapper = config.path_mapper().unwrap();
        let hsm = config.location("hsm").unwrap();
        let work = config.location("work").unwrap();
        assert_eq!(
            mapper.resolve(Path::new("exp01/ocean.nc"), hsm).unwrap(),
            Path::new("ab0123/exp01/ocean.nc")
        );
        assert_eq!(mapper.resolve(Path::new("exp01/run.log"), hsm).unwrap(), Path::new("exp01/run.log"));
        assert_eq!(mapper.resolve(Path::new("exp01/run.log"), work).unwrap(), Path::new("exp01/run.log"));
    }

    #[test]
    fn test_tag_system_extends_defaults() {
        let mut config = config();
        config.tags.rules.push(TagRuleSettings {
            pattern: "*fesom*".to_string(),
            tags: vec!["Ocean".to_string()],
        });
        let tags = config.tag_system().unwrap().tag_file("exp01/fesom.mesh.nc");
        let names: Vec<_> = tags.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["ocean", "outdata"]);

        config.tags.use_defaults = false;
        assert_eq!(config.tag_system().unwrap().rules().len(), 1);
    }

    #[test]
    fn test_invalid_tag_rule() {
        let mut config = config();
        config.tags.rules.push(TagRuleSettings {
            pattern: "re:(".to_string(),
            tags: vec!["broken".to_string()],
        });
        assert!(config.tag_system().is_err());
    }
}
