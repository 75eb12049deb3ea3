//! SCSI protocol constants and sense data
//!
//! The backend never decodes CDBs itself; it only needs the vocabulary used to
//! report completions back to the target framework: status codes, the sense
//! data attached to a CHECK CONDITION, and the fixed device identity values
//! the framework queries from the operation table.

use byteorder::{BigEndian, ByteOrder};

/// Peripheral device type for a direct-access block device (SPC `TYPE_DISK`)
pub const TYPE_DISK: u32 = 0x00;

/// SCSI protocol revision levels as reported through INQUIRY
pub mod revision {
    pub const SCSI_SPC_2: u32 = 5;
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NOT_READY: u8 = 0x02;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const LOGICAL_UNIT_COMMUNICATION_FAILURE: u8 = 0x08;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
}

/// Direction of the data phase of a command, seen from the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    /// Data flows from the device to the initiator (READ)
    FromDevice,
    /// Data flows from the initiator to the device (WRITE)
    ToDevice,
    #[default]
    None,
}

/// Reason code a backend attaches to a failed command so the framework can
/// build the matching sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseReason {
    LogicalUnitCommunicationFailure,
    InvalidCdbField,
}

impl SenseReason {
    /// Sense data the framework reports for this reason
    pub fn to_sense(self) -> SenseData {
        match self {
            SenseReason::LogicalUnitCommunicationFailure => SenseData::new(
                sense_key::NOT_READY,
                asc::LOGICAL_UNIT_COMMUNICATION_FAILURE,
                0,
            ),
            SenseReason::InvalidCdbField => {
                SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
            }
        }
    }
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }
}
