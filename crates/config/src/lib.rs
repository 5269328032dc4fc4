//! Layered configuration.
//!
//! Sources are merged in order, later ones winning:
//!
//! 1. Built-in defaults ([`Config::default`]).
//! 2. Configuration files, in the order given. The format follows the file
//!    extension: `.toml`, `.yaml`/`.yml` or `.json`.
//! 3. Environment variables prefixed with `TELLUS_`, with `__` separating
//!    nested keys (`TELLUS_CACHE__MAX_SIZE_BYTES=1073741824`).
//!
//! [`Config::discover`] looks for `tellus.{toml,yaml,yml,json}` in the user's
//! configuration directory, unless `TELLUS_CONFIG` names a file explicitly.

pub mod error;
mod settings;

pub use crate::settings::{ArchiveSettings, Config, MappingSettings, TagRuleSettings, TagSettings};

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of environment variables that override configuration values.
pub const ENV_PREFIX: &str = "TELLUS_";
/// Environment variable naming a configuration file to use instead of
/// discovery.
pub const CONFIG_PATH_ENV: &str = "TELLUS_CONFIG";
const FILE_STEM: &str = "tellus";
const EXTENSIONS: &[&str] = &["toml", "yaml", "yml", "json"];

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "tellus", "tellus")
}

impl Config {
    /// The merged provider chain, before extraction.
    pub fn figment(files: &[PathBuf]) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        for file in files {
            if !file.is_file() {
                exn::bail!(ErrorKind::MissingFile(file.clone()));
            }
            figment = match extension(file) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => exn::bail!(ErrorKind::UnsupportedFormat(file.clone())),
            };
            debug!(path = %file.display(), "Merged configuration file");
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__")))
    }

    /// Load and validate configuration from defaults, `files` and the
    /// environment.
    pub fn load(files: &[PathBuf]) -> Result<Self> {
        let config: Config = Self::figment(files)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `TELLUS_CONFIG` if set, otherwise from every
    /// `tellus.<ext>` found in the user configuration directory.
    pub fn discover() -> Result<Self> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            info!(path = %path.display(), "{CONFIG_PATH_ENV} set, using configuration file");
            return Self::load(&[path]);
        }
        let files: Vec<PathBuf> = project_dirs()
            .map(|dirs| candidates(dirs.config_dir()))
            .unwrap_or_default();
        if files.is_empty() {
            debug!("No configuration files found, using defaults");
        }
        Self::load(&files)
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

/// Existing `tellus.<ext>` files in `dir`, in merge order.
fn candidates(dir: &Path) -> Vec<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{FILE_STEM}.{ext}")))
        .filter(|path| path.is_file())
        .collect()
}
