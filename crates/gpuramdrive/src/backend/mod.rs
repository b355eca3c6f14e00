//! Memory backends holding the disk contents
//!
//! A backend is chosen once per mount from [`BackendKind`] and lives on the
//! drive worker thread until the mount is torn down. Dropping a backend frees
//! its memory.

mod cuda;
mod host;
mod opencl;

pub use cuda::CudaBackend;
pub use host::HostBackend;
pub use opencl::OpenClBackend;

use crate::error::AllocationError;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Which memory holds the disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// Process heap
    #[default]
    Host,
    /// OpenCL device buffer
    OpenCl,
    /// CUDA device allocation
    Cuda,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "host" | "hostmem" => Ok(BackendKind::Host),
            "opencl" | "cl" => Ok(BackendKind::OpenCl),
            "cuda" => Ok(BackendKind::Cuda),
            _ => Err(format!(
                "unknown backend '{s}' (expected host, opencl or cuda)"
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Host => "host",
            BackendKind::OpenCl => "opencl",
            BackendKind::Cuda => "cuda",
        })
    }
}

/// Device within a backend: platform index and device index
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendSelector {
    pub platform: usize,
    pub device: usize,
}

/// An enumerated device that can hold a disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDevice {
    pub selector: BackendSelector,
    pub name: String,
    /// Total memory in bytes
    pub memory_size: u64,
}

/// Storage for the disk bytes
///
/// Callers keep `offset + len` within [`size`](MemoryBackend::size); the
/// backend does not re-check. A short return means the transfer failed.
pub trait MemoryBackend: Send {
    /// Capacity in bytes
    fn size(&self) -> u64;

    /// Copy `dst.len()` bytes starting at `offset` into `dst`
    fn read(&mut self, offset: u64, dst: &mut [u8]) -> usize;

    /// Copy `src` into the backend starting at `offset`
    fn write(&mut self, offset: u64, src: &[u8]) -> usize;

    /// Which kind of memory this is
    fn kind(&self) -> BackendKind;
}

/// Allocate `size` bytes on the selected device
pub fn allocate(
    kind: BackendKind,
    selector: BackendSelector,
    size: u64,
) -> Result<Box<dyn MemoryBackend>, AllocationError> {
    debug!(%kind, ?selector, size, "allocating backend memory");
    Ok(match kind {
        BackendKind::Host => Box::new(HostBackend::allocate(size)?),
        BackendKind::OpenCl => Box::new(OpenClBackend::allocate(selector, size)?),
        BackendKind::Cuda => Box::new(CudaBackend::allocate(selector, size)?),
    })
}

/// Enumerate the devices a backend can allocate on
pub fn list_devices(kind: BackendKind) -> Result<Vec<GpuDevice>, AllocationError> {
    match kind {
        BackendKind::Host => Ok(vec![host::host_device()]),
        BackendKind::OpenCl => opencl::list_devices(),
        BackendKind::Cuda => cuda::list_devices(),
    }
}

/// Read a NUL-terminated name out of a fixed buffer
pub(crate) fn c_name(buffer: &[u8]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..len]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("Host".parse::<BackendKind>(), Ok(BackendKind::Host));
        assert_eq!("OPENCL".parse::<BackendKind>(), Ok(BackendKind::OpenCl));
        assert_eq!("cuda".parse::<BackendKind>(), Ok(BackendKind::Cuda));
        assert!("vulkan".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_allocate_host_round_trip() {
        let mut backend = allocate(BackendKind::Host, BackendSelector::default(), 4096).unwrap();
        assert_eq!(backend.kind(), BackendKind::Host);
        assert_eq!(backend.size(), 4096);

        let pattern: Vec<u8> = (0..=255).collect();
        assert_eq!(backend.write(1000, &pattern), pattern.len());

        let mut out = vec![0u8; pattern.len()];
        assert_eq!(backend.read(1000, &mut out), pattern.len());
        assert_eq!(out, pattern);
    }

    #[test]
    fn test_list_host_devices() {
        let devices = list_devices(BackendKind::Host).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Host Memory");
        assert_eq!(devices[0].selector, BackendSelector::default());
    }

    #[test]
    fn test_c_name() {
        assert_eq!(c_name(b"GeForce\0garbage"), "GeForce");
        assert_eq!(c_name(b"NoTerminator"), "NoTerminator");
    }
}
