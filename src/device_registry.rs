//! # Device Registry
//!
//! In-memory set of devices discovered on the bus, keyed by secondary
//! address. Insertion order is discovery order; inserting an address that is
//! already present is a no-op. The registry lives as long as the process and
//! is rebuilt by every probe.

use crate::error::MBusError;
use crate::mbus::secondary_addressing::{SecondaryAddress, SecondaryMask};
use serde::Serialize;
use std::collections::HashMap;

/// Default capacity, one entry per usable primary address.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 250;

/// A discovered bus participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    secondary_address: SecondaryAddress,
    primary_address: Option<u8>,
}

impl Device {
    pub fn new(secondary_address: SecondaryAddress, primary_address: Option<u8>) -> Self {
        Device {
            secondary_address,
            primary_address,
        }
    }

    pub fn secondary_address(&self) -> &SecondaryAddress {
        &self.secondary_address
    }

    pub fn primary_address(&self) -> Option<u8> {
        self.primary_address
    }
}

/// Outcome of [`DeviceRegistry::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    New,
    Duplicate,
}

/// Ordered, deduplicated, capacity-bounded device collection.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    index: HashMap<SecondaryAddress, usize>,
    capacity: usize,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REGISTRY_CAPACITY)
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        DeviceRegistry {
            devices: Vec::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    /// Adds `device` unless its secondary address is already registered.
    ///
    /// A duplicate leaves the existing entry, its position and its primary
    /// address untouched.
    pub fn insert(&mut self, device: Device) -> Result<Inserted, MBusError> {
        if self.index.contains_key(&device.secondary_address) {
            return Ok(Inserted::Duplicate);
        }
        if self.devices.len() >= self.capacity {
            return Err(MBusError::RegistryFull(self.capacity));
        }

        self.index
            .insert(device.secondary_address.clone(), self.devices.len());
        self.devices.push(device);
        Ok(Inserted::New)
    }

    pub fn contains(&self, address: &SecondaryAddress) -> bool {
        self.index.contains_key(address)
    }

    pub fn get(&self, address: &SecondaryAddress) -> Option<&Device> {
        self.index.get(address).map(|&i| &self.devices[i])
    }

    /// Rebinds the primary address of a registered device. Returns `false`
    /// when the device is unknown.
    pub fn set_primary_address(&mut self, address: &SecondaryAddress, primary: u8) -> bool {
        match self.index.get(address) {
            Some(&i) => {
                self.devices[i].primary_address = Some(primary);
                true
            }
            None => false,
        }
    }

    /// Registered devices whose secondary address matches `mask`.
    pub fn matching<'a>(&'a self, mask: &'a SecondaryMask) -> impl Iterator<Item = &'a Device> + 'a {
        self.devices
            .iter()
            .filter(move |d| d.secondary_address.matches(mask))
    }

    /// Registered devices currently bound to `primary`.
    pub fn with_primary(&self, primary: u8) -> impl Iterator<Item = &Device> + '_ {
        self.devices
            .iter()
            .filter(move |d| d.primary_address == Some(primary))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> + '_ {
        self.devices.iter()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        self.index.clear();
    }
}
