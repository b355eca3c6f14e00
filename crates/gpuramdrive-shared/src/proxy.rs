//! ImDisk proxy wire protocol
//!
//! Every field is a 64-bit little-endian slot at the start of the section.
//! Requests and responses reuse the same bytes:
//! ```text
//! request                response (READ/WRITE)   response (INFO)
//! ┌────────────────┐     ┌────────────────┐       ┌──────────────────┐
//! │ code: u64      │     │ errorno: u64   │       │ file_size: u64   │
//! │ offset: u64    │     │ length: u64    │       │ req_alignment    │
//! │ length: u64    │     │                │       │ flags: u64       │
//! └────────────────┘     └────────────────┘       └──────────────────┘
//! ```
//!
//! The request code only ever uses the low 32 bits of its slot.

/// Bytes occupied by a request record
pub const REQUEST_SIZE: usize = 24;

/// Bytes occupied by a READ/WRITE response record
pub const TRANSFER_RESPONSE_SIZE: usize = 16;

/// Bytes occupied by an INFO response record
pub const INFO_RESPONSE_SIZE: usize = 24;

/// Code written back over unknown requests ("no such device")
pub const ENODEV: u64 = 19;

/// Request codes understood by the ImDisk proxy protocol
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    /// Empty request
    Null = 0,
    /// Query size, alignment and flags
    Info = 1,
    /// Read from the backend into the data buffer
    Read = 2,
    /// Write the data buffer to the backend
    Write = 3,
    /// Connect to a remote proxy (not used with shared memory)
    Connect = 4,
    /// Driver is done with this device
    Close = 5,
    /// Discard a range
    Unmap = 6,
    /// Zero a range
    Zero = 7,
    /// SCSI pass-through
    Scsi = 8,
    /// Shared-key request
    Shared = 9,
}

impl RequestCode {
    /// Decode a raw code slot; `None` for values outside the protocol
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(RequestCode::Null),
            1 => Some(RequestCode::Info),
            2 => Some(RequestCode::Read),
            3 => Some(RequestCode::Write),
            4 => Some(RequestCode::Connect),
            5 => Some(RequestCode::Close),
            6 => Some(RequestCode::Unmap),
            7 => Some(RequestCode::Zero),
            8 => Some(RequestCode::Scsi),
            9 => Some(RequestCode::Shared),
            _ => None,
        }
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut slot = [0u8; 8];
    slot.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(slot)
}

fn write_u64(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// Request record written by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRequest {
    /// Raw request code slot
    pub code: u64,
    /// Byte offset into the virtual disk
    pub offset: u64,
    /// Requested transfer length in bytes
    pub length: u64,
}

impl ProxyRequest {
    /// Create a request for a known code
    pub fn new(code: RequestCode, offset: u64, length: u64) -> Self {
        Self {
            code: code as u64,
            offset,
            length,
        }
    }

    /// Decoded request code, if it is part of the protocol
    pub fn request_code(&self) -> Option<RequestCode> {
        RequestCode::from_raw(self.code)
    }

    /// Serialize to bytes (little-endian)
    pub fn to_bytes(&self) -> [u8; REQUEST_SIZE] {
        let mut bytes = [0u8; REQUEST_SIZE];
        self.write_to(&mut bytes);
        bytes
    }

    /// Write the record into the start of a header region
    pub fn write_to(&self, header: &mut [u8]) {
        write_u64(header, 0, self.code);
        write_u64(header, 8, self.offset);
        write_u64(header, 16, self.length);
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < REQUEST_SIZE {
            return None;
        }
        Some(Self {
            code: read_u64(bytes, 0),
            offset: read_u64(bytes, 8),
            length: read_u64(bytes, 16),
        })
    }
}

/// Response to READ and WRITE requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferResponse {
    /// Error number, 0 on success
    pub errorno: u64,
    /// Bytes actually transferred
    pub length: u64,
}

impl TransferResponse {
    /// Successful transfer of `length` bytes
    pub fn ok(length: u64) -> Self {
        Self { errorno: 0, length }
    }

    /// Write the record into the start of a header region
    pub fn write_to(&self, header: &mut [u8]) {
        write_u64(header, 0, self.errorno);
        write_u64(header, 8, self.length);
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TRANSFER_RESPONSE_SIZE {
            return None;
        }
        Some(Self {
            errorno: read_u64(bytes, 0),
            length: read_u64(bytes, 8),
        })
    }
}

/// Response to INFO requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoResponse {
    /// Size of the virtual disk in bytes
    pub file_size: u64,
    /// Required alignment of offsets and lengths
    pub req_alignment: u64,
    /// Device flags
    pub flags: u64,
}

impl InfoResponse {
    /// Info for a disk of `file_size` bytes with no alignment constraint
    pub fn for_size(file_size: u64) -> Self {
        Self {
            file_size,
            req_alignment: 1,
            flags: 0,
        }
    }

    /// Write the record into the start of a header region
    pub fn write_to(&self, header: &mut [u8]) {
        write_u64(header, 0, self.file_size);
        write_u64(header, 8, self.req_alignment);
        write_u64(header, 16, self.flags);
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INFO_RESPONSE_SIZE {
            return None;
        }
        Some(Self {
            file_size: read_u64(bytes, 0),
            req_alignment: read_u64(bytes, 8),
            flags: read_u64(bytes, 16),
        })
    }
}

/// Overwrite the request code slot with the "no such device" sentinel
pub fn reject_request(header: &mut [u8]) {
    write_u64(header, 0, ENODEV);
}
