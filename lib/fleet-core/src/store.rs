//! Optional persistence for registrations

use crate::{RegistrationOptions, Result, ServiceInstance};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A registration as written to a store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRegistration {
    pub instance: ServiceInstance,
    pub options: RegistrationOptions,
}

/// Load/save collaborator. Durability guarantees are up to the implementation.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedRegistration>>;
    fn save(&self, registrations: &[PersistedRegistration]) -> Result<()>;
}

/// Stores registrations as a JSON array in a single file
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> Result<Vec<PersistedRegistration>> {
        if !self.path.exists() {
            debug!("No registry snapshot at {}", self.path.display());
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, registrations: &[PersistedRegistration]) -> Result<()> {
        let data = serde_json::to_vec_pretty(registrations)?;
        // Swapped into place by rename so readers never see a partial file
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            "Saved {} registrations to {}",
            registrations.len(),
            self.path.display()
        );
        Ok(())
    }
}
