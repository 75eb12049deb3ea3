//! FILEIO device descriptors
//!
//! A device starts life as an [`FdDevice`]: allocated under a host, then
//! configured through parameter strings. Activation consumes it and yields an
//! [`FdActiveDevice`] owning the open backing object. Freeing the active
//! device closes the handle; there is no way back to the configurable state.

use crate::backing::{BackingKind, BackingStore};
use crate::error::FileIoResult;
use crate::geometry::Geometry;
use crate::host::FdHost;
use crate::params::FdParams;
use crate::registry::DeviceAttributes;
use std::sync::{Arc, Weak};

/// Anything whose parameters can be rendered as a status line
pub trait DescribeParams {
    fn describe(&self) -> String;
}

/// An allocated, not yet activated device
#[derive(Debug)]
pub struct FdDevice {
    pub(crate) host: Weak<FdHost>,
    pub(crate) params: FdParams,
}

impl FdDevice {
    pub(crate) fn new(host: &Arc<FdHost>) -> Self {
        FdDevice {
            host: Arc::downgrade(host),
            params: FdParams::default(),
        }
    }

    pub fn params(&self) -> &FdParams {
        &self.params
    }

    /// Apply a `key=value[,key=value...]` parameter string
    pub fn apply_parameters(&mut self, page: &str) -> FileIoResult<usize> {
        self.params.apply(page)
    }

    pub fn validate(&self) -> FileIoResult<()> {
        self.params.validate()
    }
}

impl DescribeParams for FdDevice {
    fn describe(&self) -> String {
        self.params.render(0, self.params.dev_size().unwrap_or(0))
    }
}

/// A device with an open backing object, registered with the transport core
pub struct FdActiveDevice {
    pub(crate) params: FdParams,
    pub(crate) dev_id: u32,
    pub(crate) host_id: u32,
    pub(crate) queue_depth: u32,
    pub(crate) geometry: Geometry,
    pub(crate) attrib: DeviceAttributes,
    pub(crate) backing: Box<dyn BackingStore>,
}

impl FdActiveDevice {
    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn params(&self) -> &FdParams {
        &self.params
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attrib
    }

    pub fn kind(&self) -> BackingKind {
        self.geometry.kind()
    }

    /// Block size commands are addressed in
    pub fn block_size(&self) -> u32 {
        self.attrib.block_size
    }

    pub(crate) fn backing(&self) -> &dyn BackingStore {
        self.backing.as_ref()
    }

    /// Capacity in bytes, re-read from the backing object for block devices
    pub fn capacity_bytes(&self) -> FileIoResult<u64> {
        let live = match self.kind() {
            BackingKind::BlockDevice => self.backing.size().map_err(crate::IoError::Os)?,
            BackingKind::File => 0,
        };
        Ok(self.geometry.capacity_bytes(live))
    }

    /// Number of addressable blocks
    ///
    /// Recomputed on every call so a resized block device is picked up
    /// without reactivation.
    pub fn current_block_count(&self) -> FileIoResult<u64> {
        Ok(self.capacity_bytes()? / u64::from(self.block_size()))
    }

    /// Close the backing object and release the device
    pub fn release(self) {
        log::debug!(
            "FILEIO: releasing device {} at {}",
            self.dev_id,
            self.params
                .dev_name()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        );
    }
}

impl DescribeParams for FdActiveDevice {
    fn describe(&self) -> String {
        self.params
            .render(self.dev_id, self.capacity_bytes().unwrap_or(0))
    }
}

impl std::fmt::Debug for FdActiveDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdActiveDevice")
            .field("params", &self.params)
            .field("dev_id", &self.dev_id)
            .field("host_id", &self.host_id)
            .field("queue_depth", &self.queue_depth)
            .field("geometry", &self.geometry)
            .field("attrib", &self.attrib)
            .finish_non_exhaustive()
    }
}
