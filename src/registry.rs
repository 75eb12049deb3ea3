//! Backend registry and transport core
//!
//! The registry is created once at process start and handed to whoever needs
//! it by reference. Backends register their template under a unique name;
//! device creation goes through the registry's [`TransportCore`] impl, which
//! turns the limits a backend proposes into the attributes the device runs
//! with.

use crate::backend::SubsystemTemplate;
use crate::error::{ActivationError, FileIoError, FileIoResult};
use crate::geometry::DeviceLimits;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Attributes negotiated for a device when it is added to the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttributes {
    pub block_size: u32,
    pub hw_max_sectors: u32,
    pub max_sectors: u32,
    pub hw_queue_depth: u32,
    pub queue_depth: u32,
    pub emulate_write_cache: bool,
    pub emulate_fua_write: bool,
}

/// The framework side of device creation
pub trait TransportCore: Send + Sync {
    /// Add a device created by `template` under host `host_id`
    fn add_device(
        &self,
        template: &dyn SubsystemTemplate,
        host_id: u32,
        limits: &DeviceLimits,
    ) -> FileIoResult<DeviceAttributes>;

    /// Drop a device previously added by `template` under host `host_id`
    fn remove_device(&self, template: &dyn SubsystemTemplate, host_id: u32);
}

struct Entry {
    template: Arc<dyn SubsystemTemplate>,
    devices: u64,
}

/// Process-wide table of registered backend templates
#[derive(Default)]
pub struct SubsystemRegistry {
    entries: Mutex<HashMap<&'static str, Entry>>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> FileIoResult<MutexGuard<'_, HashMap<&'static str, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| FileIoError::Registry("registry lock poisoned".into()))
    }

    /// Register a backend template; names must be unique
    pub fn register(&self, template: Arc<dyn SubsystemTemplate>) -> FileIoResult<()> {
        let name = template.name();
        let mut entries = self.lock()?;
        if entries.contains_key(name) {
            return Err(FileIoError::Registry(format!(
                "backend {} already registered",
                name
            )));
        }
        log::info!(
            "Registered backend {} version {}",
            name,
            template.version()
        );
        entries.insert(name, Entry { template, devices: 0 });
        Ok(())
    }

    /// Remove a backend template, handing it back to the caller
    pub fn unregister(&self, name: &str) -> FileIoResult<Arc<dyn SubsystemTemplate>> {
        let entry = self
            .lock()?
            .remove(name)
            .ok_or_else(|| FileIoError::Registry(format!("backend {} not registered", name)))?;
        log::info!("Released backend {}", name);
        Ok(entry.template)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn SubsystemTemplate>> {
        self.lock()
            .ok()?
            .get(name)
            .map(|entry| Arc::clone(&entry.template))
    }

    /// Number of live devices added through a registered backend
    pub fn device_count(&self, name: &str) -> Option<u64> {
        self.lock().ok()?.get(name).map(|entry| entry.devices)
    }
}

impl TransportCore for SubsystemRegistry {
    fn add_device(
        &self,
        template: &dyn SubsystemTemplate,
        host_id: u32,
        limits: &DeviceLimits,
    ) -> FileIoResult<DeviceAttributes> {
        let registration = |msg: String| FileIoError::from(ActivationError::Registration(msg));

        if limits.logical_block_size == 0 {
            return Err(registration("zero logical block size".into()));
        }
        if limits.queue_depth == 0 || limits.hw_queue_depth == 0 {
            return Err(registration("zero queue depth".into()));
        }

        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(template.name())
            .ok_or_else(|| registration(format!("backend {} not registered", template.name())))?;
        entry.devices += 1;

        let attrib = DeviceAttributes {
            block_size: limits.logical_block_size,
            hw_max_sectors: limits.max_hw_sectors,
            max_sectors: limits.max_sectors.min(limits.max_hw_sectors),
            hw_queue_depth: limits.hw_queue_depth,
            queue_depth: limits.queue_depth.min(limits.hw_queue_depth),
            emulate_write_cache: template.write_cache_emulated(),
            emulate_fua_write: template.fua_write_emulated(),
        };
        log::debug!(
            "CORE_HBA[{}] - Added {} device: block_size {} queue_depth {}",
            host_id,
            template.name(),
            attrib.block_size,
            attrib.queue_depth
        );
        Ok(attrib)
    }

    fn remove_device(&self, template: &dyn SubsystemTemplate, host_id: u32) {
        let mut entries = match self.lock() {
            Ok(entries) => entries,
            Err(e) => {
                log::error!("CORE_HBA[{}] - cannot remove device: {}", host_id, e);
                return;
            }
        };
        match entries.get_mut(template.name()) {
            Some(entry) if entry.devices > 0 => {
                entry.devices -= 1;
                log::debug!(
                    "CORE_HBA[{}] - Removed {} device, {} left",
                    host_id,
                    template.name(),
                    entry.devices
                );
            }
            Some(_) => log::warn!(
                "CORE_HBA[{}] - {} has no devices to remove",
                host_id,
                template.name()
            ),
            None => log::warn!(
                "CORE_HBA[{}] - removing device of unregistered backend {}",
                host_id,
                template.name()
            ),
        }
    }
}
