//! Geometry resolution for a freshly opened backing object
//!
//! Block devices describe themselves; regular files fall back to the backend's
//! defaults and the size declared through `dev_size=`.

use crate::backing::{BackingKind, BackingStore};
use crate::error::{ActivationError, FileIoResult};
use std::io;

/// Backend defaults applied to file backings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDefaults {
    pub block_size: u32,
    pub max_sectors: u32,
}

/// Limits proposed to the transport core when a device is added
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub logical_block_size: u32,
    pub max_hw_sectors: u32,
    pub max_sectors: u32,
    pub hw_queue_depth: u32,
    pub queue_depth: u32,
}

/// Resolved geometry of a backing object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    /// Raw block device; capacity follows the live device size
    BlockDevice {
        logical_block_size: u32,
        max_hw_sectors: u32,
        max_sectors: u32,
    },
    /// Ordinary file; capacity follows the declared size
    File { block_size: u32, max_sectors: u32, dev_size: u64 },
}

impl Geometry {
    /// Inspect `backing` and derive its geometry
    ///
    /// `dev_size` is the declared size; it is required for files and ignored
    /// for block devices.
    pub fn resolve(
        backing: &dyn BackingStore,
        dev_size: Option<u64>,
        defaults: FileDefaults,
    ) -> FileIoResult<Geometry> {
        match backing.kind() {
            BackingKind::BlockDevice => {
                let limits = backing.block_limits().map_err(ActivationError::Geometry)?;
                if limits.logical_block_size == 0 {
                    return Err(ActivationError::Geometry(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "block device reports zero logical block size",
                    ))
                    .into());
                }
                let geometry = Geometry::BlockDevice {
                    logical_block_size: limits.logical_block_size,
                    max_hw_sectors: limits.max_hw_sectors.unwrap_or(defaults.max_sectors),
                    max_sectors: limits.max_sectors.unwrap_or(defaults.max_sectors),
                };

                let size = backing.size().map_err(ActivationError::Geometry)?;
                let dev_size = block_device_bytes(size, limits.logical_block_size);
                log::debug!(
                    "FILEIO: Using size: {} bytes from block device blocks: {} logical_block_size: {}",
                    dev_size,
                    dev_size / u64::from(limits.logical_block_size),
                    limits.logical_block_size
                );
                Ok(geometry)
            }
            BackingKind::File => {
                let Some(dev_size) = dev_size else {
                    log::error!(
                        "FILEIO: Missing dev_size= parameter, and no backing block device"
                    );
                    return Err(ActivationError::MissingSize.into());
                };
                Ok(Geometry::File {
                    block_size: defaults.block_size,
                    max_sectors: defaults.max_sectors,
                    dev_size,
                })
            }
        }
    }

    pub fn kind(&self) -> BackingKind {
        match self {
            Geometry::BlockDevice { .. } => BackingKind::BlockDevice,
            Geometry::File { .. } => BackingKind::File,
        }
    }

    pub fn block_size(&self) -> u32 {
        match *self {
            Geometry::BlockDevice {
                logical_block_size, ..
            } => logical_block_size,
            Geometry::File { block_size, .. } => block_size,
        }
    }

    /// Limits to propose to the transport core
    pub fn limits(&self, hw_queue_depth: u32, queue_depth: u32) -> DeviceLimits {
        let (max_hw_sectors, max_sectors) = match *self {
            Geometry::BlockDevice {
                max_hw_sectors,
                max_sectors,
                ..
            } => (max_hw_sectors, max_sectors),
            Geometry::File { max_sectors, .. } => (max_sectors, max_sectors),
        };
        DeviceLimits {
            logical_block_size: self.block_size(),
            max_hw_sectors,
            max_sectors,
            hw_queue_depth,
            queue_depth,
        }
    }

    /// Capacity in bytes for the given live object size
    pub fn capacity_bytes(&self, live_size: u64) -> u64 {
        match *self {
            Geometry::BlockDevice {
                logical_block_size, ..
            } => block_device_bytes(live_size, logical_block_size),
            Geometry::File { dev_size, .. } => dev_size,
        }
    }
}

/// Usable bytes of a block device: everything but the final logical block
fn block_device_bytes(size: u64, logical_block_size: u32) -> u64 {
    size.saturating_sub(u64::from(logical_block_size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{BlockLimits, FlushRange};
    use std::io::{IoSlice, IoSliceMut};

    struct FakeBacking {
        kind: BackingKind,
        size: u64,
        limits: BlockLimits,
    }

    impl BackingStore for FakeBacking {
        fn kind(&self) -> BackingKind {
            self.kind
        }
        fn size(&self) -> io::Result<u64> {
            Ok(self.size)
        }
        fn block_limits(&self) -> io::Result<BlockLimits> {
            Ok(self.limits)
        }
        fn ensure_len(&self, _len: u64) -> io::Result<()> {
            Ok(())
        }
        fn read_vectored_at(&self, _: &mut [IoSliceMut<'_>], _: u64) -> io::Result<usize> {
            Ok(0)
        }
        fn write_vectored_at(&self, _: &[IoSlice<'_>], _: u64) -> io::Result<usize> {
            Ok(0)
        }
        fn sync_range(&self, _: FlushRange) -> io::Result<()> {
            Ok(())
        }
    }

    const DEFAULTS: FileDefaults = FileDefaults {
        block_size: 512,
        max_sectors: 1024,
    };

    fn block_device(size: u64, lbs: u32, hw: Option<u32>) -> FakeBacking {
        FakeBacking {
            kind: BackingKind::BlockDevice,
            size,
            limits: BlockLimits {
                logical_block_size: lbs,
                max_hw_sectors: hw,
                max_sectors: hw.map(|s| s / 2),
            },
        }
    }

    #[test]
    fn test_block_device_uses_own_limits() {
        let backing = block_device(1 << 30, 4096, Some(2048));
        let geometry = Geometry::resolve(&backing, Some(12345), DEFAULTS).unwrap();
        assert_eq!(
            geometry,
            Geometry::BlockDevice {
                logical_block_size: 4096,
                max_hw_sectors: 2048,
                max_sectors: 1024,
            }
        );
        assert_eq!(geometry.kind(), BackingKind::BlockDevice);
        // declared size is ignored, one logical block is reserved
        assert_eq!(geometry.capacity_bytes(1 << 30), (1 << 30) - 4096);
    }

    #[test]
    fn test_block_device_missing_queue_limits_fall_back() {
        let backing = block_device(1 << 20, 512, None);
        let geometry = Geometry::resolve(&backing, None, DEFAULTS).unwrap();
        let limits = geometry.limits(128, 32);
        assert_eq!(limits.max_hw_sectors, 1024);
        assert_eq!(limits.max_sectors, 1024);
        assert_eq!(limits.logical_block_size, 512);
    }

    #[test]
    fn test_block_device_smaller_than_one_block() {
        let geometry = Geometry::BlockDevice {
            logical_block_size: 512,
            max_hw_sectors: 8,
            max_sectors: 8,
        };
        assert_eq!(geometry.capacity_bytes(100), 0);
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let backing = block_device(1 << 20, 0, None);
        assert!(Geometry::resolve(&backing, None, DEFAULTS).is_err());
    }

    #[test]
    fn test_file_requires_declared_size() {
        let backing = FakeBacking {
            kind: BackingKind::File,
            size: 0,
            limits: BlockLimits {
                logical_block_size: 0,
                max_hw_sectors: None,
                max_sectors: None,
            },
        };
        let err = Geometry::resolve(&backing, None, DEFAULTS).unwrap_err();
        assert!(matches!(
            err,
            crate::FileIoError::Activation(ActivationError::MissingSize)
        ));

        let geometry = Geometry::resolve(&backing, Some(1048576), DEFAULTS).unwrap();
        assert_eq!(geometry.block_size(), 512);
        assert_eq!(geometry.capacity_bytes(0), 1048576);
        assert_eq!(
            geometry.limits(128, 32),
            DeviceLimits {
                logical_block_size: 512,
                max_hw_sectors: 1024,
                max_sectors: 1024,
                hw_queue_depth: 128,
                queue_depth: 32,
            }
        );
    }
}
