//! Backing objects: the files and block devices that hold a device's bytes
//!
//! The I/O executor and geometry resolver only talk to [`BackingStore`], so a
//! device can be served by a regular file, a raw block device, or anything
//! else an embedder wants to plug in through a custom [`BackingOpener`].

use nix::sys::stat::{major, minor};
use nix::sys::uio::{preadv, pwritev};
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Sector unit used by queue limits
pub const SECTOR_SIZE: u32 = 512;

mod ioctl {
    // BLKSSZGET is an old-style ioctl without encoded size information.
    nix::ioctl_read_bad!(blksszget, 0x1268, libc::c_int);
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
}

/// What kind of object sits behind an open handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    BlockDevice,
    File,
}

/// Limits a block device publishes for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLimits {
    pub logical_block_size: u32,
    /// In 512-byte sectors; `None` when the kernel does not publish it
    pub max_hw_sectors: Option<u32>,
    pub max_sectors: Option<u32>,
}

/// Byte range to make durable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRange {
    pub start: u64,
    /// Exclusive end; `None` flushes to the end of the device
    pub end: Option<u64>,
}

impl FlushRange {
    pub const WHOLE_DEVICE: FlushRange = FlushRange {
        start: 0,
        end: None,
    };

    pub fn is_whole_device(&self) -> bool {
        *self == Self::WHOLE_DEVICE
    }
}

/// An open backing object
pub trait BackingStore: Send + Sync {
    fn kind(&self) -> BackingKind;

    /// Current size in bytes
    fn size(&self) -> io::Result<u64>;

    /// Published limits; only meaningful for block devices
    fn block_limits(&self) -> io::Result<BlockLimits>;

    /// Grow the object to at least `len` bytes
    fn ensure_len(&self, len: u64) -> io::Result<()>;

    /// Single vectored read at `offset`; may return fewer bytes than requested
    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize>;

    /// Single vectored write at `offset`; may return fewer bytes than requested
    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize>;

    /// Make the data in `range` durable
    ///
    /// Implementations may widen the range, up to flushing the whole object.
    /// They must never flush less than `range`.
    fn sync_range(&self, range: FlushRange) -> io::Result<()>;
}

/// Opens a backing path
pub trait BackingOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<Box<dyn BackingStore>>;
}

/// Opens paths read/write, creating them if absent, with `O_DSYNC`
///
/// `O_DSYNC` rather than `O_SYNC` skips syncing pure timestamp updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct PosixOpener;

impl BackingOpener for PosixOpener {
    fn open(&self, path: &Path) -> io::Result<Box<dyn BackingStore>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .custom_flags(libc::O_DSYNC)
            .open(path)?;

        let meta = file.metadata()?;
        let kind = if meta.file_type().is_block_device() {
            BackingKind::BlockDevice
        } else {
            BackingKind::File
        };
        log::debug!("FILEIO: opened {} as {:?}", path.display(), kind);

        Ok(Box::new(PosixBacking {
            file,
            kind,
            rdev: meta.rdev(),
            path: path.to_path_buf(),
        }))
    }
}

/// A file or block device opened through [`PosixOpener`]
#[derive(Debug)]
pub struct PosixBacking {
    file: File,
    kind: BackingKind,
    rdev: u64,
    path: PathBuf,
}

impl PosixBacking {
    fn logical_block_size(&self) -> io::Result<u32> {
        let mut size: libc::c_int = 0;
        // SAFETY: the fd is owned by `self.file` and `size` is a valid c_int out-pointer.
        unsafe { ioctl::blksszget(self.file.as_raw_fd(), &mut size) }.map_err(io::Error::from)?;
        u32::try_from(size).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bogus logical block size {}", size),
            )
        })
    }

    /// Read a `queue/*_kb` attribute from sysfs and convert it to sectors
    fn queue_limit_sectors(&self, attr: &str) -> Option<u32> {
        let path = format!(
            "/sys/dev/block/{}:{}/queue/{}",
            major(self.rdev),
            minor(self.rdev),
            attr
        );
        let kb: u32 = std::fs::read_to_string(&path).ok()?.trim().parse().ok()?;
        kb.checked_mul(1024 / SECTOR_SIZE)
    }
}

impl BackingStore for PosixBacking {
    fn kind(&self) -> BackingKind {
        self.kind
    }

    fn size(&self) -> io::Result<u64> {
        match self.kind {
            BackingKind::BlockDevice => {
                let mut size: u64 = 0;
                // SAFETY: the fd is owned by `self.file` and `size` is a valid u64 out-pointer.
                unsafe { ioctl::blkgetsize64(self.file.as_raw_fd(), &mut size) }
                    .map_err(io::Error::from)?;
                Ok(size)
            }
            BackingKind::File => Ok(self.file.metadata()?.len()),
        }
    }

    fn block_limits(&self) -> io::Result<BlockLimits> {
        Ok(BlockLimits {
            logical_block_size: self.logical_block_size()?,
            max_hw_sectors: self.queue_limit_sectors("max_hw_sectors_kb"),
            max_sectors: self.queue_limit_sectors("max_sectors_kb"),
        })
    }

    fn ensure_len(&self, len: u64) -> io::Result<()> {
        if self.kind == BackingKind::File && self.file.metadata()?.len() < len {
            log::debug!("FILEIO: extending {} to {} bytes", self.path.display(), len);
            self.file.set_len(len)?;
        }
        Ok(())
    }

    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
        let offset = to_off_t(offset)?;
        preadv(&self.file, bufs, offset).map_err(io::Error::from)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        let offset = to_off_t(offset)?;
        pwritev(&self.file, bufs, offset).map_err(io::Error::from)
    }

    fn sync_range(&self, range: FlushRange) -> io::Result<()> {
        log::debug!(
            "FILEIO: flushing {} [{}, {:?})",
            self.path.display(),
            range.start,
            range.end
        );
        // fdatasync covers the whole file, a superset of any range.
        self.file.sync_data()
    }
}

fn to_off_t(offset: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(offset)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset exceeds off_t"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_file_is_file_kind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lun.img");
        let backing = PosixOpener.open(&path).unwrap();
        assert_eq!(backing.kind(), BackingKind::File);
        assert_eq!(backing.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_ensure_len_only_grows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lun.img");
        let backing = PosixOpener.open(&path).unwrap();
        backing.ensure_len(8192).unwrap();
        assert_eq!(backing.size().unwrap(), 8192);
        backing.ensure_len(4096).unwrap();
        assert_eq!(backing.size().unwrap(), 8192);
    }

    #[test]
    fn test_vectored_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backing = PosixOpener.open(&dir.path().join("lun.img")).unwrap();

        let a = [1u8; 3];
        let b = [2u8; 5];
        let n = backing
            .write_vectored_at(&[IoSlice::new(&a), IoSlice::new(&b)], 100)
            .unwrap();
        assert_eq!(n, 8);

        let mut x = [0u8; 4];
        let mut y = [0u8; 4];
        let n = backing
            .read_vectored_at(&mut [IoSliceMut::new(&mut x), IoSliceMut::new(&mut y)], 100)
            .unwrap();
        assert_eq!(n, 8);
        assert_eq!(x, [1, 1, 1, 2]);
        assert_eq!(y, [2, 2, 2, 2]);

        backing.sync_range(FlushRange::WHOLE_DEVICE).unwrap();
    }

    #[test]
    fn test_bounded_range_flush_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lun.img");
        let backing = PosixOpener.open(&path).unwrap();
        backing.ensure_len(8192).unwrap();

        let data = [0xC3u8; 512];
        backing
            .write_vectored_at(&[IoSlice::new(&data)], 4096)
            .unwrap();
        backing
            .sync_range(FlushRange {
                start: 4096,
                end: Some(4608),
            })
            .unwrap();
        backing
            .sync_range(FlushRange {
                start: 1024,
                end: None,
            })
            .unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[4096..4608], &data[..]);
    }

    #[test]
    fn test_flush_range_whole_device() {
        assert!(FlushRange::WHOLE_DEVICE.is_whole_device());
        assert!(!FlushRange {
            start: 512,
            end: None
        }
        .is_whole_device());
    }
}
