//! Building the store from configuration and tearing it down again.

use crate::assemble::FragmentAssemblyService;
use crate::create::{ArchiveCreationConfig, ArchiveCreationService};
use crate::error::{ErrorKind, Result};
use crate::extract::ArchiveExtractionService;
use crate::locations::Locations;
use crate::registry::ArchiveRegistry;
use exn::{OptionExt, ResultExt};
use std::sync::Arc;
use tellus_cache::CacheManager;
use tellus_config::Config;
use tellus_storage::LocationRegistry;
use tracing::{info, instrument};

/// Every long-lived object of one process, wired together.
///
/// Services share the registry, locations and cache through `Arc`s, so they
/// can be cloned out and moved into tasks. Call [`Session::close`] before
/// exiting to flush the cache index.
pub struct Session {
    config: Config,
    locations: Arc<Locations>,
    registry: Arc<ArchiveRegistry>,
    cache: Arc<CacheManager>,
    creation: Arc<ArchiveCreationService>,
    extraction: Arc<ArchiveExtractionService>,
    assembly: Arc<FragmentAssemblyService>,
}

impl Session {
    /// Open a session with the default location kinds.
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with(config, &LocationRegistry::with_defaults()).await
    }

    /// Open a session, building backends through `backends`.
    ///
    /// The archive registry is rebuilt from the sidecars found in every
    /// location.
    #[instrument(skip_all, fields(locations = config.locations.len()))]
    pub async fn open_with(config: Config, backends: &LocationRegistry) -> Result<Self> {
        config.validate().or_raise(|| ErrorKind::Config)?;
        let locations = Arc::new(Locations::open_all(backends, &config.locations)?);
        let tags = Arc::new(config.tag_system().or_raise(|| ErrorKind::Config)?);
        let mapper = Arc::new(config.path_mapper().or_raise(|| ErrorKind::Config)?);
        let cache = Arc::new(CacheManager::open(config.cache.clone()).await.or_raise(|| ErrorKind::Cache)?);

        let registry = Arc::new(ArchiveRegistry::new());
        for location in locations.iter() {
            registry.rebuild_from_sidecars(location).await?;
        }

        let creation = Arc::new(ArchiveCreationService::new(locations.clone(), tags, registry.clone()));
        let extraction = Arc::new(ArchiveExtractionService::new(
            registry.clone(),
            locations.clone(),
            mapper,
            cache.clone(),
        ));
        let assembly = Arc::new(FragmentAssemblyService::new(
            registry.clone(),
            extraction.clone(),
            cache.clone(),
        ));
        info!(archives = registry.len().await, "Session opened");
        Ok(Self {
            config,
            locations,
            registry,
            cache,
            creation,
            extraction,
            assembly,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn locations(&self) -> &Arc<Locations> {
        &self.locations
    }

    pub fn registry(&self) -> &Arc<ArchiveRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn creation(&self) -> &Arc<ArchiveCreationService> {
        &self.creation
    }

    pub fn extraction(&self) -> &Arc<ArchiveExtractionService> {
        &self.extraction
    }

    pub fn assembly(&self) -> &Arc<FragmentAssemblyService> {
        &self.assembly
    }

    /// Creation settings for an archive called `name`, filled in from the
    /// configured archive defaults.
    pub fn creation_config(&self, name: &str) -> Result<ArchiveCreationConfig> {
        let settings = &self.config.archive;
        let destination = settings
            .destination
            .clone()
            .ok_or_raise(|| ErrorKind::InvalidRequest("no default archive destination configured".to_string()))?;
        let mut config =
            ArchiveCreationConfig::new(name, destination).with_compression(settings.compression, settings.level);
        config.write_sidecar = settings.write_sidecar;
        Ok(config)
    }

    /// Close the cache index. Services cloned out of the session fail with
    /// [`ErrorKind::Cache`] afterwards.
    pub async fn close(self) {
        self.cache.close().await;
        info!("Session closed");
    }
}
