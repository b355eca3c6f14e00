//! GpuRamDrive - virtual disks held in GPU or host memory
//!
//! The ImDisk driver exposes the disk to Windows and forwards every block
//! request to this process over a shared memory proxy channel. This crate
//! holds the disk bytes and answers those requests.
//!
//! # Architecture
//!
//! - [`backend`] - Host, OpenCL and CUDA memory behind [`MemoryBackend`]
//! - [`server`] - Proxy request loop run by the drive worker
//! - [`driver`] - Registering devices with the kernel driver
//! - [`drive`] - [`RamDrive`] lifecycle: allocate, serve, mount, unmount
//! - [`volume`] / [`environment`] - Format, label and temp folder setup
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> gpuramdrive::Result<()> {
//! use gpuramdrive::{DriveDescriptor, ImDiskDriver, RamDrive};
//! use gpuramdrive_shared::Win32Namespace;
//! use std::sync::Arc;
//!
//! let driver = ImDiskDriver::load().map_err(gpuramdrive::DriveError::DeviceRegistration)?;
//! let mut drive = RamDrive::new(Arc::new(driver), Arc::new(Win32Namespace));
//! drive.create(DriveDescriptor::new(512 << 20, "R:"))?;
//! // ... use R:
//! drive.unmount();
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod backend;
pub mod config;
pub mod drive;
pub mod driver;
pub mod environment;
pub mod error;
pub mod server;
pub mod volume;

pub use backend::{BackendKind, BackendSelector, GpuDevice, MemoryBackend, allocate, list_devices};
pub use config::{DEFAULT_SERVICE_NAME, DriveDescriptor, DriveType, FormatOptions, parse_size};
pub use drive::{DriveState, RamDrive, TeardownOrigin};
#[cfg(windows)]
pub use driver::ImDiskDriver;
pub use driver::{AUTO_DEVICE_NUMBER, DeviceRegistration, VirtualDiskDriver};
pub use error::{
    AllocationError, DriveError, DriverError, EnvironmentError, Result, VolumeError,
};
