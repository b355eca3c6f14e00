//! Shared types and IPC protocol for GpuRamDrive
//!
//! The ImDisk driver delegates block I/O to this process through a named
//! shared memory section and a pair of auto-reset events.
//!
//! # Architecture
//!
//! - [`ProxyChannel`] - Created by the server, owns the section, the server
//!   mutex and both events
//! - [`ProxyClient`] - Opens an existing channel from the driver side (used by
//!   diagnostics and tests)
//! - [`Namespace`] - Where the named objects live: [`LocalNamespace`] inside
//!   this process, `Win32Namespace` in the global Windows object namespace
//!
//! # Message Protocol
//!
//! Requests and responses share the header region defined in [`proxy`]:
//! - [`ProxyRequest`] - Request code, offset and length written by the driver
//! - [`InfoResponse`] / [`TransferResponse`] - Written back by the server

#![deny(missing_docs)]

pub mod channel;
pub mod local;
pub mod proxy;
#[cfg(windows)]
pub mod win32;

pub use channel::*;
pub use local::LocalNamespace;
pub use proxy::*;
#[cfg(windows)]
pub use win32::Win32Namespace;

/// Prefix placing every named object in the global (cross-session) namespace
pub const GLOBAL_PREFIX: &str = "Global\\";

/// Size of the request/response header at the start of the section
pub const PROXY_HEADER_SIZE: usize = 4096;

/// Size of the data buffer following the header
pub const REQUEST_BUFFER_SIZE: usize = 4 << 20; // 4MB

/// Total size of the shared section
pub const SHARED_MEMORY_SIZE: usize = PROXY_HEADER_SIZE + REQUEST_BUFFER_SIZE;
