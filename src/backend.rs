//! The FILEIO backend and the operation table it implements
//!
//! [`SubsystemTemplate`] is the object-safe part of the table (identity and
//! capabilities) that the [`SubsystemRegistry`](crate::SubsystemRegistry)
//! stores. [`SubsystemApi`] adds the lifecycle and I/O entry points the
//! framework drives for each host and device.

use crate::backing::{BackingOpener, PosixOpener};
use crate::device::{DescribeParams, FdActiveDevice, FdDevice};
use crate::error::{ActivationError, FileIoError, FileIoResult};
use crate::geometry::{FileDefaults, Geometry};
use crate::host::FdHost;
use crate::io::{self, BackendCommand};
use crate::registry::TransportCore;
use crate::scsi::{revision, TYPE_DISK};
use std::sync::Arc;

pub const FD_VERSION: &str = "4.0";
pub const FD_BLOCKSIZE: u32 = 512;
pub const FD_MAX_SECTORS: u32 = 1024;
pub const FD_DEVICE_QUEUE_DEPTH: u32 = 32;
pub const FD_MAX_DEVICE_QUEUE_DEPTH: u32 = 128;

/// How a backend's devices attach to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Virtual adapter with pseudo devices, no physical HBA behind it
    VirtualHbaPseudoDevice,
}

/// Identity and capabilities of a backend
pub trait SubsystemTemplate: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    fn transport_type(&self) -> TransportType;

    fn write_cache_emulated(&self) -> bool;

    fn fua_write_emulated(&self) -> bool;

    /// SCSI protocol revision reported for devices of this backend
    fn device_rev(&self) -> u32;

    /// Peripheral device type reported for devices of this backend
    fn device_type(&self) -> u32;
}

/// Operation table the framework drives
pub trait SubsystemApi: SubsystemTemplate {
    type Host;
    /// Allocated but not yet created device
    type VirtDevice: DescribeParams;
    /// Created (active) device
    type Device: DescribeParams;

    fn attach_hba(&self, host_id: u32) -> FileIoResult<Self::Host>;

    /// Release the host; all its devices must already be freed
    fn detach_hba(&self, host: Self::Host);

    fn allocate_virtdevice(&self, host: &Self::Host, name: &str)
        -> FileIoResult<Self::VirtDevice>;

    fn create_virtdevice(
        &self,
        core: &dyn TransportCore,
        dev: Self::VirtDevice,
    ) -> FileIoResult<Self::Device>;

    /// Release the device from `core` and close its backing object
    fn free_device(&self, core: &dyn TransportCore, dev: Self::Device);

    fn set_dev_params(&self, dev: &mut Self::VirtDevice, page: &str) -> FileIoResult<usize>;

    fn check_dev_params(&self, dev: &Self::VirtDevice) -> FileIoResult<()>;

    fn show_dev_params(&self, dev: &dyn DescribeParams) -> String {
        dev.describe()
    }

    fn get_blocks(&self, dev: &Self::Device) -> FileIoResult<u64>;

    fn execute_rw(&self, dev: &Self::Device, cmd: &mut BackendCommand) -> FileIoResult<()>;

    fn execute_sync_cache(&self, dev: &Self::Device, cmd: &mut BackendCommand)
        -> FileIoResult<()>;
}

/// File and block-device backed storage backend
pub struct FileIoBackend {
    opener: Arc<dyn BackingOpener>,
    defaults: FileDefaults,
    queue_depth: u32,
    hw_queue_depth: u32,
}

impl FileIoBackend {
    /// Backend with the default limits and the POSIX opener
    pub fn new() -> Self {
        FileIoBackend {
            opener: Arc::new(PosixOpener),
            defaults: FileDefaults {
                block_size: FD_BLOCKSIZE,
                max_sectors: FD_MAX_SECTORS,
            },
            queue_depth: FD_DEVICE_QUEUE_DEPTH,
            hw_queue_depth: FD_MAX_DEVICE_QUEUE_DEPTH,
        }
    }

    pub fn builder() -> FileIoBackendBuilder {
        FileIoBackendBuilder::new()
    }
}

impl Default for FileIoBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemTemplate for FileIoBackend {
    fn name(&self) -> &'static str {
        "fileio"
    }

    fn version(&self) -> &'static str {
        FD_VERSION
    }

    fn transport_type(&self) -> TransportType {
        TransportType::VirtualHbaPseudoDevice
    }

    fn write_cache_emulated(&self) -> bool {
        true
    }

    fn fua_write_emulated(&self) -> bool {
        true
    }

    fn device_rev(&self) -> u32 {
        // Initiators see SPC-3 in the INQUIRY data.
        revision::SCSI_SPC_2
    }

    fn device_type(&self) -> u32 {
        TYPE_DISK
    }
}

impl SubsystemApi for FileIoBackend {
    type Host = Arc<FdHost>;
    type VirtDevice = FdDevice;
    type Device = FdActiveDevice;

    fn attach_hba(&self, host_id: u32) -> FileIoResult<Arc<FdHost>> {
        let host = Arc::new(FdHost::new(host_id));
        log::debug!(
            "CORE_HBA[{}] - Attached FILEIO HBA {} version {}, MaxSectors: {}",
            host_id,
            self.name(),
            FD_VERSION,
            self.defaults.max_sectors
        );
        Ok(host)
    }

    fn detach_hba(&self, host: Arc<FdHost>) {
        let outstanding = Arc::strong_count(&host) - 1;
        if outstanding > 0 {
            log::warn!(
                "CORE_HBA[{}] - detaching with {} outstanding references",
                host.host_id(),
                outstanding
            );
        }
        log::debug!(
            "CORE_HBA[{}] - Detached FILEIO HBA after {} devices",
            host.host_id(),
            host.devices_created()
        );
    }

    fn allocate_virtdevice(&self, host: &Arc<FdHost>, name: &str) -> FileIoResult<FdDevice> {
        log::debug!("FILEIO: Allocated device {} on host {}", name, host.host_id());
        Ok(FdDevice::new(host))
    }

    fn create_virtdevice(
        &self,
        core: &dyn TransportCore,
        dev: FdDevice,
    ) -> FileIoResult<FdActiveDevice> {
        let host = dev.host.upgrade().ok_or(ActivationError::HostDetached)?;
        let path = dev.params.dev_name().ok_or(ActivationError::MissingPath)?;

        let backing = self.opener.open(path).map_err(|source| {
            log::error!("open({}) failed: {}", path.display(), source);
            ActivationError::Open {
                path: path.to_path_buf(),
                source,
            }
        })?;

        // From here on every early return drops `backing`, closing the handle.
        let geometry = Geometry::resolve(backing.as_ref(), dev.params.dev_size(), self.defaults)?;
        if let Geometry::File { dev_size, .. } = geometry {
            backing
                .ensure_len(dev_size)
                .map_err(ActivationError::Geometry)?;
        }

        let limits = geometry.limits(self.hw_queue_depth, self.queue_depth);
        let attrib = core.add_device(self, host.host_id(), &limits)?;
        if attrib.block_size == 0 || attrib.queue_depth == 0 {
            return Err(ActivationError::Registration(
                "transport core returned empty attributes".into(),
            )
            .into());
        }

        let dev_id = host.next_dev_id();
        let active = FdActiveDevice {
            dev_id,
            host_id: host.host_id(),
            queue_depth: attrib.queue_depth,
            geometry,
            attrib,
            backing,
            params: dev.params,
        };

        log::debug!(
            "CORE_FILE[{}] - Added FILEIO Device ID: {} at {}, {} total bytes",
            active.host_id,
            dev_id,
            path_display(&active),
            active.capacity_bytes().unwrap_or(0)
        );
        Ok(active)
    }

    fn free_device(&self, core: &dyn TransportCore, dev: FdActiveDevice) {
        core.remove_device(self, dev.host_id());
        dev.release();
    }

    fn set_dev_params(&self, dev: &mut FdDevice, page: &str) -> FileIoResult<usize> {
        dev.apply_parameters(page)
    }

    fn check_dev_params(&self, dev: &FdDevice) -> FileIoResult<()> {
        dev.validate()
    }

    fn get_blocks(&self, dev: &FdActiveDevice) -> FileIoResult<u64> {
        dev.current_block_count()
    }

    fn execute_rw(&self, dev: &FdActiveDevice, cmd: &mut BackendCommand) -> FileIoResult<()> {
        io::execute_rw(dev, cmd)
    }

    fn execute_sync_cache(
        &self,
        dev: &FdActiveDevice,
        cmd: &mut BackendCommand,
    ) -> FileIoResult<()> {
        io::execute_sync_cache(dev, cmd)
    }
}

fn path_display(dev: &FdActiveDevice) -> String {
    dev.params()
        .dev_name()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

/// Builder for a [`FileIoBackend`] with non-default limits
pub struct FileIoBackendBuilder {
    block_size: u32,
    max_sectors: u32,
    queue_depth: u32,
    hw_queue_depth: u32,
    opener: Option<Arc<dyn BackingOpener>>,
}

impl FileIoBackendBuilder {
    fn new() -> Self {
        Self {
            block_size: FD_BLOCKSIZE,
            max_sectors: FD_MAX_SECTORS,
            queue_depth: FD_DEVICE_QUEUE_DEPTH,
            hw_queue_depth: FD_MAX_DEVICE_QUEUE_DEPTH,
            opener: None,
        }
    }

    /// Logical block size for file backings (default: 512)
    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Maximum transfer in 512-byte sectors for file backings (default: 1024)
    pub fn max_sectors(mut self, max_sectors: u32) -> Self {
        self.max_sectors = max_sectors;
        self
    }

    /// Queue depth proposed for new devices (default: 32)
    pub fn queue_depth(mut self, queue_depth: u32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Hardware queue depth proposed for new devices (default: 128)
    pub fn hw_queue_depth(mut self, hw_queue_depth: u32) -> Self {
        self.hw_queue_depth = hw_queue_depth;
        self
    }

    /// Use a custom opener for backing paths
    pub fn opener(mut self, opener: Arc<dyn BackingOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn build(self) -> FileIoResult<FileIoBackend> {
        if !self.block_size.is_power_of_two() || !(512..=4096).contains(&self.block_size) {
            return Err(FileIoError::Validation(format!(
                "block_size must be a power of two between 512 and 4096, got {}",
                self.block_size
            )));
        }
        if self.max_sectors == 0 {
            return Err(FileIoError::Validation("max_sectors must be non-zero".into()));
        }
        if self.queue_depth == 0 || self.queue_depth > self.hw_queue_depth {
            return Err(FileIoError::Validation(format!(
                "queue_depth {} must be in 1..={}",
                self.queue_depth, self.hw_queue_depth
            )));
        }

        Ok(FileIoBackend {
            opener: self.opener.unwrap_or_else(|| Arc::new(PosixOpener)),
            defaults: FileDefaults {
                block_size: self.block_size,
                max_sectors: self.max_sectors,
            },
            queue_depth: self.queue_depth,
            hw_queue_depth: self.hw_queue_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_identity() {
        let backend = FileIoBackend::new();
        assert_eq!(backend.name(), "fileio");
        assert_eq!(backend.version(), "4.0");
        assert_eq!(backend.device_type(), TYPE_DISK);
        assert_eq!(backend.device_rev(), revision::SCSI_SPC_2);
        assert_eq!(
            backend.transport_type(),
            TransportType::VirtualHbaPseudoDevice
        );
        assert!(backend.write_cache_emulated());
        assert!(backend.fua_write_emulated());
    }

    #[test]
    fn test_builder_validation() {
        assert!(FileIoBackend::builder().block_size(4096).build().is_ok());
        assert!(FileIoBackend::builder().block_size(1000).build().is_err());
        assert!(FileIoBackend::builder().block_size(256).build().is_err());
        assert!(FileIoBackend::builder().max_sectors(0).build().is_err());
        assert!(FileIoBackend::builder().queue_depth(0).build().is_err());
        assert!(FileIoBackend::builder()
            .queue_depth(64)
            .hw_queue_depth(32)
            .build()
            .is_err());
    }

    #[test]
    fn test_detached_host_blocks_activation() {
        let registry = crate::SubsystemRegistry::new();
        let backend = FileIoBackend::new();
        let host = backend.attach_hba(1).unwrap();
        let mut dev = backend.allocate_virtdevice(&host, "lun0").unwrap();
        backend
            .set_dev_params(&mut dev, "dev_name=/nonexistent/x,dev_size=4096")
            .unwrap();
        backend.detach_hba(host);

        let err = backend.create_virtdevice(&registry, dev).unwrap_err();
        assert!(matches!(
            err,
            FileIoError::Activation(ActivationError::HostDetached)
        ));
    }

    #[test]
    fn test_missing_path_blocks_activation() {
        let registry = crate::SubsystemRegistry::new();
        let backend = FileIoBackend::new();
        let host = backend.attach_hba(1).unwrap();
        let dev = backend.allocate_virtdevice(&host, "lun0").unwrap();
        assert!(backend.check_dev_params(&dev).is_err());
        let err = backend.create_virtdevice(&registry, dev).unwrap_err();
        assert!(matches!(
            err,
            FileIoError::Activation(ActivationError::MissingPath)
        ));
    }

    #[test]
    fn test_show_params_before_activation() {
        let backend = FileIoBackend::new();
        let host = backend.attach_hba(0).unwrap();
        let mut dev = backend.allocate_virtdevice(&host, "lun0").unwrap();
        backend
            .set_dev_params(&mut dev, "dev_name=/srv/a.img,dev_size=4096")
            .unwrap();
        let line = backend.show_dev_params(&dev);
        assert!(line.contains("/srv/a.img"));
        assert!(line.contains("Size: 4096"));
        assert!(line.contains("Mode: O_DSYNC"));
    }
}
