//! I/O execution: vectored reads/writes, cache flushes and FUA
//!
//! Each scatter/gather segment becomes one iovec, in order, and the whole
//! transfer is issued as a single vectored call at
//! `lba * block_size`. Completion is reported through the command, mirroring
//! how the target framework expects a backend to behave:
//!
//! - read/write success: the backend signals GOOD
//! - read/write failure: the backend attaches a sense reason and returns the
//!   error; the framework builds the CHECK CONDITION itself
//! - sync-cache: the backend always signals completion itself

use crate::backing::{BackingKind, FlushRange};
use crate::device::FdActiveDevice;
use crate::error::{FileIoError, FileIoResult, IoError};
use crate::scsi::{scsi_status, DataDirection, SenseReason};
use std::fmt;
use std::io::{IoSlice, IoSliceMut};

/// Buffer fragments making up one logical transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterGatherList {
    segments: Vec<Vec<u8>>,
}

impl ScatterGatherList {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        ScatterGatherList { segments }
    }

    /// Zeroed segments of the given lengths
    pub fn with_lengths(lengths: &[usize]) -> Self {
        Self::new(lengths.iter().map(|&len| vec![0u8; len]).collect())
    }

    /// Split `data` into segments of at most `segment_len` bytes
    pub fn from_bytes(data: &[u8], segment_len: usize) -> Self {
        Self::new(
            data.chunks(segment_len.max(1))
                .map(<[u8]>::to_vec)
                .collect(),
        )
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.segments
    }

    /// Concatenate all segments
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }

    /// Zero every byte from `offset` to the end of the list
    fn zero_from(&mut self, mut offset: usize) {
        for seg in &mut self.segments {
            if offset >= seg.len() {
                offset -= seg.len();
                continue;
            }
            seg[offset..].fill(0);
            offset = 0;
        }
    }

    fn io_slices(&self) -> FileIoResult<Vec<IoSlice<'_>>> {
        let mut iov = Vec::new();
        iov.try_reserve_exact(self.segments.len())
            .map_err(|e| FileIoError::Allocation(format!("iovec[{}]: {}", self.nents(), e)))?;
        iov.extend(self.segments.iter().map(|seg| IoSlice::new(seg)));
        Ok(iov)
    }

    fn io_slices_mut(&mut self) -> FileIoResult<Vec<IoSliceMut<'_>>> {
        let nents = self.segments.len();
        let mut iov = Vec::new();
        iov.try_reserve_exact(nents)
            .map_err(|e| FileIoError::Allocation(format!("iovec[{}]: {}", nents, e)))?;
        iov.extend(self.segments.iter_mut().map(|seg| IoSliceMut::new(seg)));
        Ok(iov)
    }
}

type CompletionFn = Box<dyn FnMut(u8) + Send>;

/// A command dispatched to the backend by the framework
pub struct BackendCommand {
    pub lba: u64,
    /// Transfer length in bytes
    pub data_length: usize,
    pub direction: DataDirection,
    /// Forced Unit Access requested by the initiator
    pub fua: bool,
    /// SYNCHRONIZE CACHE IMMED bit
    pub immediate: bool,
    pub sgl: ScatterGatherList,
    status: Option<u8>,
    sense_reason: Option<SenseReason>,
    on_complete: Option<CompletionFn>,
}

impl BackendCommand {
    fn with_direction(lba: u64, sgl: ScatterGatherList, direction: DataDirection) -> Self {
        BackendCommand {
            lba,
            data_length: sgl.len(),
            direction,
            fua: false,
            immediate: false,
            sgl,
            status: None,
            sense_reason: None,
            on_complete: None,
        }
    }

    /// READ into `sgl` starting at `lba`
    pub fn read(lba: u64, sgl: ScatterGatherList) -> Self {
        Self::with_direction(lba, sgl, DataDirection::FromDevice)
    }

    /// WRITE the contents of `sgl` starting at `lba`
    pub fn write(lba: u64, sgl: ScatterGatherList) -> Self {
        Self::with_direction(lba, sgl, DataDirection::ToDevice)
    }

    /// SYNCHRONIZE CACHE covering `data_length` bytes from `lba`
    pub fn sync_cache(lba: u64, data_length: usize) -> Self {
        let mut cmd = Self::with_direction(lba, ScatterGatherList::default(), DataDirection::None);
        cmd.data_length = data_length;
        cmd
    }

    pub fn with_fua(mut self, fua: bool) -> Self {
        self.fua = fua;
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Callback invoked with the SCSI status when the backend completes the command
    pub fn on_complete(mut self, f: impl FnMut(u8) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Status signalled by the backend, if it completed the command
    pub fn status(&self) -> Option<u8> {
        self.status
    }

    pub fn sense_reason(&self) -> Option<SenseReason> {
        self.sense_reason
    }

    pub fn is_completed(&self) -> bool {
        self.status.is_some()
    }

    pub(crate) fn complete(&mut self, status: u8) {
        if let Some(prev) = self.status {
            log::warn!(
                "command at lba {} already completed with status {:#04x}",
                self.lba,
                prev
            );
            return;
        }
        self.status = Some(status);
        if let Some(f) = self.on_complete.as_mut() {
            f(status);
        }
    }

    pub(crate) fn set_sense_reason(&mut self, reason: SenseReason) {
        self.sense_reason = Some(reason);
    }
}

impl fmt::Debug for BackendCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendCommand")
            .field("lba", &self.lba)
            .field("data_length", &self.data_length)
            .field("direction", &self.direction)
            .field("fua", &self.fua)
            .field("immediate", &self.immediate)
            .field("nents", &self.sgl.nents())
            .field("status", &self.status)
            .field("sense_reason", &self.sense_reason)
            .finish()
    }
}

fn byte_offset(lba: u64, block_size: u32) -> Result<u64, IoError> {
    lba.checked_mul(u64::from(block_size))
        .ok_or(IoError::OffsetOverflow { lba, block_size })
}

fn do_readv(dev: &FdActiveDevice, cmd: &mut BackendCommand) -> FileIoResult<usize> {
    let pos = byte_offset(cmd.lba, dev.block_size())?;
    let expected = cmd.data_length;

    let ret = {
        let mut iov = cmd.sgl.io_slices_mut()?;
        dev.backing().read_vectored_at(&mut iov, pos)
    };

    match dev.kind() {
        BackingKind::BlockDevice => {
            let n = ret.map_err(|e| {
                log::error!("readv() failed: {}, expecting {} for block device", e, expected);
                IoError::Os(e)
            })?;
            if n != expected {
                log::error!("readv() returned {}, expecting {} for block device", n, expected);
                return Err(IoError::ShortTransfer {
                    expected,
                    actual: n,
                }
                .into());
            }
        }
        BackingKind::File => {
            let n = ret.map_err(|e| {
                log::error!("readv() failed: {} for file backing", e);
                IoError::Os(e)
            })?;
            // Past the end of a short or sparse file the medium reads as zeros.
            if n < expected {
                log::debug!("readv() returned {} of {} bytes, zero-filling", n, expected);
                cmd.sgl.zero_from(n);
            }
        }
    }

    Ok(expected)
}

fn do_writev(dev: &FdActiveDevice, cmd: &BackendCommand) -> FileIoResult<usize> {
    let pos = byte_offset(cmd.lba, dev.block_size())?;
    let expected = cmd.data_length;

    let iov = cmd.sgl.io_slices()?;
    let n = dev.backing().write_vectored_at(&iov, pos).map_err(|e| {
        log::error!("writev() failed: {}", e);
        IoError::Os(e)
    })?;

    if n != expected {
        log::error!("writev() returned {}, expecting {}", n, expected);
        return Err(IoError::ShortTransfer {
            expected,
            actual: n,
        }
        .into());
    }

    Ok(n)
}

/// Execute a READ or WRITE against `dev`
pub(crate) fn execute_rw(dev: &FdActiveDevice, cmd: &mut BackendCommand) -> FileIoResult<()> {
    let result = match cmd.direction {
        DataDirection::FromDevice => do_readv(dev, cmd).map(|_| ()),
        DataDirection::ToDevice => do_writev(dev, cmd).map(|written| {
            // Implicit flush for FUA writes, independent of the write cache setting.
            if dev.attributes().emulate_fua_write && cmd.fua {
                let start = cmd.lba * u64::from(dev.block_size());
                let range = FlushRange {
                    start,
                    end: Some(start + written as u64),
                };
                if let Err(e) = dev.backing().sync_range(range) {
                    log::error!("FILEIO: FUA flush of [{}, {:?}) failed: {}", start, range.end, e);
                }
            }
        }),
        DataDirection::None => Err(IoError::NoDataDirection.into()),
    };

    match result {
        Ok(()) => {
            cmd.complete(scsi_status::GOOD);
            Ok(())
        }
        Err(e) => {
            let reason = match e {
                FileIoError::Io(IoError::NoDataDirection) => SenseReason::InvalidCdbField,
                _ => SenseReason::LogicalUnitCommunicationFailure,
            };
            cmd.set_sense_reason(reason);
            Err(e)
        }
    }
}

/// Execute a SYNCHRONIZE CACHE against `dev`
pub(crate) fn execute_sync_cache(
    dev: &FdActiveDevice,
    cmd: &mut BackendCommand,
) -> FileIoResult<()> {
    let range = if cmd.lba == 0 && cmd.data_length == 0 {
        FlushRange::WHOLE_DEVICE
    } else {
        let start = byte_offset(cmd.lba, dev.block_size())?;
        let end = if cmd.data_length == 0 {
            None
        } else {
            Some(
                start
                    .checked_add(cmd.data_length as u64)
                    .ok_or(IoError::OffsetOverflow {
                        lba: cmd.lba,
                        block_size: dev.block_size(),
                    })?,
            )
        };
        FlushRange { start, end }
    };

    // IMMED: the initiator gets GOOD before the flush is issued.
    if cmd.immediate {
        cmd.complete(scsi_status::GOOD);
    }

    let ret = dev.backing().sync_range(range);
    if let Err(e) = &ret {
        log::error!("FILEIO: sync of [{}, {:?}) failed: {}", range.start, range.end, e);
    }

    if cmd.immediate {
        return Ok(());
    }

    match ret {
        Ok(()) => cmd.complete(scsi_status::GOOD),
        Err(_) => {
            cmd.set_sense_reason(SenseReason::LogicalUnitCommunicationFailure);
            cmd.complete(scsi_status::CHECK_CONDITION);
        }
    }
    Ok(())
}
