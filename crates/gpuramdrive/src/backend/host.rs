//! Host heap backend

use super::{BackendKind, BackendSelector, GpuDevice, MemoryBackend};
use crate::error::AllocationError;

/// Disk held in a heap buffer
pub struct HostBackend {
    buffer: Vec<u8>,
}

impl HostBackend {
    pub fn allocate(size: u64) -> Result<Self, AllocationError> {
        let out_of_memory = || AllocationError::OutOfMemory {
            requested: size,
            free: None,
        };

        let len = usize::try_from(size).map_err(|_| out_of_memory())?;
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).map_err(|_| out_of_memory())?;
        buffer.resize(len, 0);
        Ok(Self { buffer })
    }
}

impl MemoryBackend for HostBackend {
    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn read(&mut self, offset: u64, dst: &mut [u8]) -> usize {
        let start = offset as usize;
        dst.copy_from_slice(&self.buffer[start..start + dst.len()]);
        dst.len()
    }

    fn write(&mut self, offset: u64, src: &[u8]) -> usize {
        let start = offset as usize;
        self.buffer[start..start + src.len()].copy_from_slice(src);
        src.len()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }
}

pub(super) fn host_device() -> GpuDevice {
    GpuDevice {
        selector: BackendSelector::default(),
        name: "Host Memory".to_string(),
        memory_size: total_physical_memory(),
    }
}

#[cfg(windows)]
fn total_physical_memory() -> u64 {
    use windows::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};

    let mut status = MEMORYSTATUSEX {
        dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
        ..Default::default()
    };
    match unsafe { GlobalMemoryStatusEx(&mut status) } {
        Ok(()) => status.ullTotalPhys,
        Err(_) => 0,
    }
}

#[cfg(not(windows))]
fn total_physical_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| parse_mem_total(&meminfo))
        .unwrap_or(0)
}

#[cfg(not(windows))]
fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_zeroed() {
        let mut backend = HostBackend::allocate(1024).unwrap();
        let mut out = [0xFFu8; 64];
        backend.read(960, &mut out);
        assert_eq!(out, [0u8; 64]);
    }

    #[test]
    fn test_write_at_end() {
        let mut backend = HostBackend::allocate(1024).unwrap();
        assert_eq!(backend.write(1020, &[1, 2, 3, 4]), 4);
        let mut out = [0u8; 4];
        assert_eq!(backend.read(1020, &mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_allocate_impossible_size() {
        let result = HostBackend::allocate(u64::MAX);
        assert!(matches!(
            result,
            Err(AllocationError::OutOfMemory { free: None, .. })
        ));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_parse_mem_total() {
        let meminfo = "MemTotal:       16314372 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_mem_total(meminfo), Some(16314372 * 1024));
        assert_eq!(parse_mem_total("MemFree: 1 kB"), None);
    }
}
