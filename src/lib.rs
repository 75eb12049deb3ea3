//! File-backed block storage for a SCSI target
//!
//! This library provides the FILEIO backend: a regular file, or a raw block
//! device opened as a file, serving as the medium behind a virtual SCSI
//! logical unit. The surrounding target framework decodes CDBs and drives the
//! backend through the [`SubsystemApi`] operation table.
//!
//! # Example
//!
//! ```no_run
//! use scsi_fileio::{
//!     BackendCommand, FileIoBackend, ScatterGatherList, SubsystemApi, SubsystemRegistry,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SubsystemRegistry::new();
//! let backend = Arc::new(FileIoBackend::new());
//! registry.register(backend.clone())?;
//!
//! let host = backend.attach_hba(0)?;
//! let mut dev = backend.allocate_virtdevice(&host, "lun0")?;
//! backend.set_dev_params(&mut dev, "dev_name=/var/lib/lun0.img,dev_size=1048576")?;
//! backend.check_dev_params(&dev)?;
//! let dev = backend.create_virtdevice(&registry, dev)?;
//! assert_eq!(backend.get_blocks(&dev)?, 2048);
//!
//! let mut cmd = BackendCommand::write(0, ScatterGatherList::from_bytes(&[0xAB; 4096], 512));
//! backend.execute_rw(&dev, &mut cmd)?;
//!
//! backend.free_device(&registry, dev);
//! backend.detach_hba(host);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod backing;
pub mod device;
pub mod error;
pub mod geometry;
pub mod host;
pub mod io;
pub mod params;
pub mod registry;
pub mod scsi;

pub use backend::{FileIoBackend, FileIoBackendBuilder, SubsystemApi, SubsystemTemplate, TransportType};
pub use backing::{BackingKind, BackingOpener, BackingStore, BlockLimits, FlushRange, PosixOpener};
pub use device::{DescribeParams, FdActiveDevice, FdDevice};
pub use error::{ActivationError, FileIoError, FileIoResult, IoError};
pub use geometry::{DeviceLimits, Geometry};
pub use host::FdHost;
pub use io::{BackendCommand, ScatterGatherList};
pub use params::FdParams;
pub use registry::{DeviceAttributes, SubsystemRegistry, TransportCore};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
