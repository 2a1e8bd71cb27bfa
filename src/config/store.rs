//! JSON-backed storage of device records.

use super::DeviceConfig;
use crate::error::{BridgeError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredDevices {
    #[serde(default)]
    devices: Vec<DeviceConfig>,
}

/// Ordered list of device records persisted to a JSON file.
///
/// Order matters: it is the index used by `test_post` and `update_device`.
#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    devices: Vec<DeviceConfig>,
}

impl DeviceStore {
    /// Load the store. A missing file is an empty store; a corrupt one is
    /// an error so it never gets overwritten by a later save.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice::<StoredDevices>(&bytes)?.devices,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No device store at {:?} (first run)", path);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!("Loaded {} device(s) from {:?}", devices.len(), path);
        Ok(Self { path, devices })
    }

    /// An unsaved store at `path` holding `devices`.
    pub fn with_devices(path: impl Into<PathBuf>, devices: Vec<DeviceConfig>) -> Self {
        Self {
            path: path.into(),
            devices,
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(&StoredDevices {
            devices: self.devices.clone(),
        })?;
        fs::write(&self.path, data)?;
        info!("Saved {} device(s) to {:?}", self.devices.len(), self.path);
        Ok(())
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn get(&self, index: usize) -> Option<&DeviceConfig> {
        self.devices.get(index)
    }

    /// Replace the record at `index`. The record must pass validation.
    pub fn replace(&mut self, index: usize, device: DeviceConfig) -> Result<()> {
        let count = self.devices.len();
        let slot = self
            .devices
            .get_mut(index)
            .ok_or(BridgeError::DeviceIndexOutOfRange { index, count })?;
        device.validate().map_err(BridgeError::InvalidDevice)?;
        *slot = device;
        Ok(())
    }
}
