use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::collections::BTreeMap;
use tellus_storage::{Location, LocationConfig, LocationRegistry};

/// Opened locations, by name.
#[derive(Clone, Debug, Default)]
pub struct Locations {
    by_name: BTreeMap<String, Location>,
}

impl Locations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every configured location through `registry`.
    pub fn open_all<'a>(
        registry: &LocationRegistry,
        configs: impl IntoIterator<Item = &'a LocationConfig>,
    ) -> Result<Self> {
        let mut locations = Self::new();
        for config in configs {
            let location = registry
                .open(config)
                .or_raise(|| ErrorKind::UnknownLocation(config.name.clone()))?;
            locations.insert(location);
        }
        Ok(locations)
    }

    /// Add a location, replacing any previous one with the same name.
    pub fn insert(&mut self, location: Location) -> Option<Location> {
        self.by_name.insert(location.name().to_string(), location)
    }

    pub fn get(&self, name: &str) -> Result<&Location> {
        match self.by_name.get(name) {
            Some(location) => Ok(location),
            None => exn::bail!(ErrorKind::UnknownLocation(name.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Location> {
        self.by_name.values()
    }

    pub fn configs(&self) -> impl Iterator<Item = &LocationConfig> {
        self.by_name.values().map(Location::config)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl FromIterator<Location> for Locations {
    fn from_iter<T: IntoIterator<Item = Location>>(iter: T) -> Self {
        let mut locations = Self::new();
        for location in iter {
            locations.insert(location);
        }
        locations
    }
}
