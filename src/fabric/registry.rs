//! Driver registry: a map from [`SubdeviceId`] to driver record,
//! authoritative during group bring-up.

use super::{LeafDriver, SubdeviceId};
use crate::error::{DeviceError, DeviceResult};
use crate::sync::Mutex;
use alloc::string::String;
use alloc::vec::Vec;

/// One `(ep_name or compat, min_count)` pair a driver claims endpoints
/// with.
#[derive(Clone)]
pub struct EndpointClaim {
    pub ep_name: Option<String>,
    pub compat: Option<String>,
    pub min_count: usize,
}

pub struct DriverRecord {
    pub driver: LeafDriver,
}

/// The registry: one mutex, touched only on (de)registration and during
/// bring-up lookups.
pub struct Registry {
    drivers: Mutex<Vec<DriverRecord>>,
}

impl Registry {
    pub const fn new() -> Self {
        Registry { drivers: Mutex::new(Vec::new()) }
    }

    pub fn register(&self, driver: LeafDriver) -> DeviceResult {
        let mut drivers = self.drivers.lock();
        if drivers.iter().any(|d| d.driver.id == driver.id) {
            return Err(DeviceError::Exists);
        }
        drivers.push(DriverRecord { driver });
        Ok(())
    }

    pub fn unregister(&self, id: SubdeviceId) {
        self.drivers.lock().retain(|d| d.driver.id != id);
    }

    /// Drivers in enum order, as group bring-up requires.
    pub fn ordered(&self) -> Vec<SubdeviceId> {
        let drivers = self.drivers.lock();
        let mut ids: Vec<SubdeviceId> = drivers.iter().map(|d| d.driver.id).collect();
        ids.sort_by_key(|id| *id as u32);
        ids
    }

    pub fn with_driver<F, R>(&self, id: SubdeviceId, f: F) -> Option<R>
    where
        F: FnOnce(&LeafDriver) -> R,
    {
        let drivers = self.drivers.lock();
        drivers.iter().find(|d| d.driver.id == id).map(|d| f(&d.driver))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
