//! Logical → physical path resolution.
//!
//! A [`PathMapper`] holds prioritized [`PathMapping`] rules. Each rule names a
//! location, a [`Pattern`] over the logical path and an [upon] template that
//! renders the physical path inside that location.
//!
//! # Template Variables
//!
//! | Variable   | Description                                         |
//! |------------|-----------------------------------------------------|
//! | `path`     | Normalized logical path                             |
//! | `dir`      | Parent directory of the logical path (may be empty) |
//! | `name`     | File name                                           |
//! | `stem`     | File name up to the first `.`                       |
//! | `ext`      | Everything after the first `.` (may be empty)       |
//! | `location` | Location name                                       |
//! | `prefix`   | The location's path prefix (may be empty)           |
//!
//! Named capture groups of `re:` patterns are exposed under their own names
//! unless they collide with the variables above. The `lower` formatter
//! lower-cases a value.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use tellus_archive::{PathMapper, PathMapping};
//! use tellus_storage::{LocationConfig, LocationKind};
//!
//! let mut mapper = PathMapper::new();
//! mapper
//!     .register_mapping(PathMapping::new("outdata/**", "hsm", "{{ prefix }}/{{ path }}"), 0)
//!     .unwrap();
//! let hsm = LocationConfig::new("hsm", LocationKind::Tape, "/hsm").with_path_prefix("ab0123");
//! let physical = mapper.resolve(Path::new("exp01/outdata/ocean.nc"), &hsm).unwrap();
//! assert_eq!(physical, Path::new("ab0123/exp01/outdata/ocean.nc"));
//! ```

use crate::error::{ErrorKind, Result};
use crate::pattern::Pattern;
use exn::{OptionExt, ResultExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tellus_storage::{LocationConfig, validate_path};
use tracing::instrument;
use upon::{Engine, Template, Value};

/// One mapping rule as written in configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    pub pattern: String,
    pub location: String,
    pub template: String,
}

impl PathMapping {
    pub fn new(pattern: impl Into<String>, location: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            location: location.into(),
            template: template.into(),
        }
    }

    /// Maps every logical path onto the same relative path in `location`.
    pub fn identity(location: impl Into<String>) -> Self {
        Self::new("**", location, "{{ path }}")
    }
}

struct CompiledMapping {
    mapping: PathMapping,
    pattern: Pattern,
    template: Template<'static>,
    priority: i32,
    sequence: u64,
}

pub struct PathMapper {
    engine: Engine<'static>,
    // Kept sorted: priority descending, then insertion order.
    mappings: Vec<CompiledMapping>,
    next_sequence: u64,
}

impl Default for PathMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PathMapper {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        addons::configure(&mut engine);
        Self {
            engine,
            mappings: Vec::new(),
            next_sequence: 0,
        }
    }

    /// Insert a rule at `priority`. Higher priorities are consulted first;
    /// among equal priorities the earliest registration wins.
    ///
    /// The pattern and template are compiled eagerly so that mistakes surface
    /// here rather than at resolution time.
    pub fn register_mapping(&mut self, mapping: PathMapping, priority: i32) -> Result<()> {
        let pattern = Pattern::parse(mapping.pattern.clone())?;
        let template = self.engine.compile(mapping.template.clone()).or_raise(|| ErrorKind::Template)?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let position = self.mappings.partition_point(|m| m.priority >= priority);
        self.mappings.insert(
            position,
            CompiledMapping {
                mapping,
                pattern,
                template,
                priority,
                sequence,
            },
        );
        Ok(())
    }

    /// Rules in resolution order, with their priorities.
    pub fn mappings(&self) -> impl Iterator<Item = (&PathMapping, i32)> {
        self.mappings.iter().map(|m| (&m.mapping, m.priority))
    }

    /// Resolve `logical_path` into a physical path relative to `location`'s
    /// root, using the first matching rule for that location.
    #[instrument(level = "debug", skip(self, location), fields(location = %location.name))]
    pub fn resolve(&self, logical_path: &Path, location: &LocationConfig) -> Result<PathBuf> {
        let logical = validate_path(logical_path).or_raise(|| ErrorKind::InvalidPath(logical_path.to_path_buf()))?;
        let rule = self
            .mappings
            .iter()
            .filter(|m| m.mapping.location == location.name)
            .find(|m| m.pattern.matches(&logical))
            .ok_or_raise(|| ErrorKind::UnresolvedPath {
                path: logical.clone(),
                location: location.name.clone(),
            })?;
        tracing::trace!(pattern = rule.pattern.as_str(), sequence = rule.sequence, "Matched path mapping");
        let rendered = rule
            .template
            .render(&self.engine, Self::parameters(&logical, location, rule.pattern.captures(&logical)))
            .to_string()
            .or_raise(|| ErrorKind::Template)?;
        Self::normalize(&rendered)
    }

    /// Resolve against every location that has a matching rule.
    pub fn resolve_all<'l>(
        &self,
        logical_path: &Path,
        locations: impl IntoIterator<Item = &'l LocationConfig>,
    ) -> Vec<(String, PathBuf)> {
        locations
            .into_iter()
            .filter_map(|location| {
                self.resolve(logical_path, location)
                    .ok()
                    .map(|physical| (location.name.clone(), physical))
            })
            .collect()
    }

    /// Trim each segment, drop empty ones, then validate.
    fn normalize(rendered: &str) -> Result<PathBuf> {
        let joined = rendered
            .trim()
            .split('/')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        validate_path(&joined).or_raise(|| ErrorKind::InvalidPath(PathBuf::from(rendered)))
    }

    fn parameters(logical: &Path, location: &LocationConfig, captures: Option<BTreeMap<String, String>>) -> Value {
        let name = logical.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let (stem, ext) = match name.split_once('.') {
            Some((stem, ext)) => (stem.to_string(), ext.to_string()),
            None => (name.clone(), String::new()),
        };
        let dir = logical.parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        let mut map: BTreeMap<String, Value> = captures
            .unwrap_or_default()
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        let builtins = [
            ("path", logical.to_string_lossy().into_owned()),
            ("dir", dir),
            ("name", name),
            ("stem", stem),
            ("ext", ext),
            ("location", location.name.clone()),
            ("prefix", location.path_prefix.clone().unwrap_or_default()),
        ];
        for (key, value) in builtins {
            map.insert(key.to_string(), Value::String(value));
        }
        Value::Map(map)
    }
}

/// Custom [`upon`] extensions.
mod addons {
    use std::fmt::Write;
    use upon::{Engine, Value, fmt as upon_fmt};

    fn lower_formatter(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        match value {
            Value::String(s) => write!(f, "{}", s.to_lowercase())?,
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }

    pub(crate) fn configure(engine: &mut Engine<'_>) {
        engine.add_formatter("lower", lower_formatter);
    }
}
