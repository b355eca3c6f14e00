//! OpenCL backend
//!
//! The ICD loader is resolved at runtime. Transfers are blocking enqueue
//! calls against a queue created for the selected device.

use super::{BackendKind, BackendSelector, GpuDevice, MemoryBackend, c_name};
use crate::error::AllocationError;
use libloading::Library;
use std::ffi::c_void;
use std::sync::OnceLock;
use tracing::debug;

type ClInt = i32;
type ClUint = u32;
type ClPlatformId = *mut c_void;
type ClDeviceId = *mut c_void;
type ClContext = *mut c_void;
type ClCommandQueue = *mut c_void;
type ClMem = *mut c_void;

const CL_SUCCESS: ClInt = 0;
const CL_MEM_OBJECT_ALLOCATION_FAILURE: ClInt = -4;
const CL_OUT_OF_RESOURCES: ClInt = -5;
const CL_OUT_OF_HOST_MEMORY: ClInt = -6;
const CL_INVALID_BUFFER_SIZE: ClInt = -61;
const CL_TRUE: ClUint = 1;

const CL_PLATFORM_NAME: ClUint = 0x0902;
const CL_DEVICE_TYPE_GPU: u64 = 1 << 2;
const CL_DEVICE_TYPE_ACCELERATOR: u64 = 1 << 3;
const CL_DEVICE_MAX_MEM_ALLOC_SIZE: ClUint = 0x1010;
const CL_DEVICE_GLOBAL_MEM_SIZE: ClUint = 0x101F;
const CL_DEVICE_NAME: ClUint = 0x102B;
const CL_DEVICE_VENDOR: ClUint = 0x102C;
const CL_MEM_READ_WRITE: u64 = 1 << 0;
const CL_MEM_ALLOC_HOST_PTR: u64 = 1 << 4;

const MAX_PLATFORMS: usize = 8;
const MAX_DEVICES: usize = 16;

/// Vendors whose discrete cards copy fastest without host-mapped buffers
const DISCRETE_VENDOR: &str = "Advanced Micro Devices";

#[cfg(windows)]
const OPENCL_LIBRARY: &str = "OpenCL.dll";
#[cfg(not(windows))]
const OPENCL_LIBRARY: &str = "libOpenCL.so.1";

type ContextCallback = Option<unsafe extern "system" fn(*const i8, *const c_void, usize, *mut c_void)>;

/// Entry points resolved from the OpenCL ICD loader
struct OpenCl {
    get_platform_ids: unsafe extern "system" fn(ClUint, *mut ClPlatformId, *mut ClUint) -> ClInt,
    get_platform_info:
        unsafe extern "system" fn(ClPlatformId, ClUint, usize, *mut c_void, *mut usize) -> ClInt,
    get_device_ids:
        unsafe extern "system" fn(ClPlatformId, u64, ClUint, *mut ClDeviceId, *mut ClUint) -> ClInt,
    get_device_info:
        unsafe extern "system" fn(ClDeviceId, ClUint, usize, *mut c_void, *mut usize) -> ClInt,
    create_context: unsafe extern "system" fn(
        *const isize,
        ClUint,
        *const ClDeviceId,
        ContextCallback,
        *mut c_void,
        *mut ClInt,
    ) -> ClContext,
    create_command_queue:
        unsafe extern "system" fn(ClContext, ClDeviceId, u64, *mut ClInt) -> ClCommandQueue,
    create_buffer: unsafe extern "system" fn(ClContext, u64, usize, *mut c_void, *mut ClInt) -> ClMem,
    enqueue_read_buffer: unsafe extern "system" fn(
        ClCommandQueue,
        ClMem,
        ClUint,
        usize,
        usize,
        *mut c_void,
        ClUint,
        *const c_void,
        *mut c_void,
    ) -> ClInt,
    enqueue_write_buffer: unsafe extern "system" fn(
        ClCommandQueue,
        ClMem,
        ClUint,
        usize,
        usize,
        *const c_void,
        ClUint,
        *const c_void,
        *mut c_void,
    ) -> ClInt,
    flush: unsafe extern "system" fn(ClCommandQueue) -> ClInt,
    finish: unsafe extern "system" fn(ClCommandQueue) -> ClInt,
    release_mem_object: unsafe extern "system" fn(ClMem) -> ClInt,
    release_command_queue: unsafe extern "system" fn(ClCommandQueue) -> ClInt,
    release_context: unsafe extern "system" fn(ClContext) -> ClInt,
    _library: Library,
}

/// Copy a function pointer out of the library
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, libloading::Error> {
    Ok(unsafe { *library.get::<T>(name)? })
}

impl OpenCl {
    fn load() -> Result<Self, libloading::Error> {
        unsafe {
            let library = Library::new(OPENCL_LIBRARY)?;
            Ok(Self {
                get_platform_ids: symbol(&library, b"clGetPlatformIDs\0")?,
                get_platform_info: symbol(&library, b"clGetPlatformInfo\0")?,
                get_device_ids: symbol(&library, b"clGetDeviceIDs\0")?,
                get_device_info: symbol(&library, b"clGetDeviceInfo\0")?,
                create_context: symbol(&library, b"clCreateContext\0")?,
                create_command_queue: symbol(&library, b"clCreateCommandQueue\0")?,
                create_buffer: symbol(&library, b"clCreateBuffer\0")?,
                enqueue_read_buffer: symbol(&library, b"clEnqueueReadBuffer\0")?,
                enqueue_write_buffer: symbol(&library, b"clEnqueueWriteBuffer\0")?,
                flush: symbol(&library, b"clFlush\0")?,
                finish: symbol(&library, b"clFinish\0")?,
                release_mem_object: symbol(&library, b"clReleaseMemObject\0")?,
                release_command_queue: symbol(&library, b"clReleaseCommandQueue\0")?,
                release_context: symbol(&library, b"clReleaseContext\0")?,
                _library: library,
            })
        }
    }

    fn platforms(&self) -> Result<Vec<ClPlatformId>, AllocationError> {
        let mut platforms = [std::ptr::null_mut(); MAX_PLATFORMS];
        let mut count: ClUint = 0;
        let ret = unsafe {
            (self.get_platform_ids)(MAX_PLATFORMS as ClUint, platforms.as_mut_ptr(), &mut count)
        };
        check("clGetPlatformIDs", ret)?;
        Ok(platforms[..(count as usize).min(MAX_PLATFORMS)].to_vec())
    }

    fn devices(&self, platform: ClPlatformId) -> Option<Vec<ClDeviceId>> {
        let mut devices = [std::ptr::null_mut(); MAX_DEVICES];
        let mut count: ClUint = 0;
        let ret = unsafe {
            (self.get_device_ids)(
                platform,
                CL_DEVICE_TYPE_GPU | CL_DEVICE_TYPE_ACCELERATOR,
                MAX_DEVICES as ClUint,
                devices.as_mut_ptr(),
                &mut count,
            )
        };
        (ret == CL_SUCCESS).then(|| devices[..(count as usize).min(MAX_DEVICES)].to_vec())
    }

    fn platform_string(&self, platform: ClPlatformId, param: ClUint) -> Option<String> {
        let mut buffer = [0u8; 1024];
        let ret = unsafe {
            (self.get_platform_info)(
                platform,
                param,
                buffer.len(),
                buffer.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        (ret == CL_SUCCESS).then(|| c_name(&buffer))
    }

    fn device_string(&self, device: ClDeviceId, param: ClUint) -> Result<String, ClInt> {
        let mut buffer = [0u8; 1024];
        let ret = unsafe {
            (self.get_device_info)(
                device,
                param,
                buffer.len(),
                buffer.as_mut_ptr() as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        if ret == CL_SUCCESS { Ok(c_name(&buffer)) } else { Err(ret) }
    }

    fn device_u64(&self, device: ClDeviceId, param: ClUint) -> Result<u64, ClInt> {
        let mut value: u64 = 0;
        let ret = unsafe {
            (self.get_device_info)(
                device,
                param,
                std::mem::size_of::<u64>(),
                &mut value as *mut u64 as *mut c_void,
                std::ptr::null_mut(),
            )
        };
        if ret == CL_SUCCESS { Ok(value) } else { Err(ret) }
    }

    fn resolve(&self, selector: BackendSelector) -> Result<ClDeviceId, AllocationError> {
        let no_such_device = || AllocationError::NoSuchDevice {
            platform: selector.platform,
            device: selector.device,
        };
        let platform = *self
            .platforms()?
            .get(selector.platform)
            .ok_or_else(no_such_device)?;
        self.devices(platform)
            .and_then(|devices| devices.get(selector.device).copied())
            .ok_or_else(no_such_device)
    }
}

fn opencl() -> Result<&'static OpenCl, AllocationError> {
    static OPENCL: OnceLock<Result<OpenCl, String>> = OnceLock::new();

    OPENCL
        .get_or_init(|| OpenCl::load().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|reason| AllocationError::RuntimeUnavailable {
            api: "OpenCL",
            reason: reason.clone(),
        })
}

fn check(call: &'static str, ret: ClInt) -> Result<(), AllocationError> {
    if ret == CL_SUCCESS {
        Ok(())
    } else {
        Err(AllocationError::Api {
            call,
            code: i64::from(ret),
        })
    }
}

fn is_out_of_memory(ret: ClInt) -> bool {
    matches!(
        ret,
        CL_MEM_OBJECT_ALLOCATION_FAILURE
            | CL_OUT_OF_RESOURCES
            | CL_OUT_OF_HOST_MEMORY
            | CL_INVALID_BUFFER_SIZE
    )
}

/// Error for a failed `clCreateBuffer`. Core OpenCL has no free-memory
/// query, so out-of-memory carries no free byte count.
fn buffer_error(ret: ClInt, requested: u64) -> AllocationError {
    if is_out_of_memory(ret) {
        AllocationError::OutOfMemory {
            requested,
            free: None,
        }
    } else {
        AllocationError::Api {
            call: "clCreateBuffer",
            code: i64::from(ret),
        }
    }
}

/// Buffer flags for a device of the given vendor
fn buffer_flags(vendor: &str) -> u64 {
    if vendor.contains(DISCRETE_VENDOR) {
        CL_MEM_READ_WRITE
    } else {
        CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR
    }
}

/// Disk held in an OpenCL device buffer
pub struct OpenClBackend {
    api: &'static OpenCl,
    context: ClContext,
    queue: ClCommandQueue,
    buffer: ClMem,
    size: u64,
}

// SAFETY: OpenCL objects are thread-safe handles (OpenCL 1.1+); the backend
// is only ever used from one thread at a time.
unsafe impl Send for OpenClBackend {}

impl OpenClBackend {
    pub fn allocate(selector: BackendSelector, size: u64) -> Result<Self, AllocationError> {
        let api = opencl()?;
        let device = api.resolve(selector)?;
        let bytes = usize::try_from(size).map_err(|_| AllocationError::OutOfMemory {
            requested: size,
            free: None,
        })?;

        // Built up field by field so Drop releases whatever exists on failure
        let mut backend = Self {
            api,
            context: std::ptr::null_mut(),
            queue: std::ptr::null_mut(),
            buffer: std::ptr::null_mut(),
            size,
        };

        let mut ret: ClInt = CL_SUCCESS;
        backend.context = unsafe {
            (api.create_context)(
                std::ptr::null(),
                1,
                &device,
                None,
                std::ptr::null_mut(),
                &mut ret,
            )
        };
        if backend.context.is_null() {
            return Err(AllocationError::Api {
                call: "clCreateContext",
                code: i64::from(ret),
            });
        }

        backend.queue = unsafe { (api.create_command_queue)(backend.context, device, 0, &mut ret) };
        if backend.queue.is_null() {
            return Err(AllocationError::Api {
                call: "clCreateCommandQueue",
                code: i64::from(ret),
            });
        }

        let max_alloc = api
            .device_u64(device, CL_DEVICE_MAX_MEM_ALLOC_SIZE)
            .map_err(|code| AllocationError::Api {
                call: "clGetDeviceInfo",
                code: i64::from(code),
            })?;
        let vendor = api
            .device_string(device, CL_DEVICE_VENDOR)
            .map_err(|code| AllocationError::Api {
                call: "clGetDeviceInfo",
                code: i64::from(code),
            })?;
        debug!(%vendor, max_alloc, size, "creating OpenCL buffer");

        backend.buffer = unsafe {
            (api.create_buffer)(
                backend.context,
                buffer_flags(&vendor),
                bytes,
                std::ptr::null_mut(),
                &mut ret,
            )
        };
        if backend.buffer.is_null() {
            return Err(buffer_error(ret, size));
        }

        Ok(backend)
    }
}

impl MemoryBackend for OpenClBackend {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, dst: &mut [u8]) -> usize {
        let ret = unsafe {
            (self.api.enqueue_read_buffer)(
                self.queue,
                self.buffer,
                CL_TRUE,
                offset as usize,
                dst.len(),
                dst.as_mut_ptr() as *mut c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        if ret == CL_SUCCESS { dst.len() } else { 0 }
    }

    fn write(&mut self, offset: u64, src: &[u8]) -> usize {
        let ret = unsafe {
            (self.api.enqueue_write_buffer)(
                self.queue,
                self.buffer,
                CL_TRUE,
                offset as usize,
                src.len(),
                src.as_ptr() as *const c_void,
                0,
                std::ptr::null(),
                std::ptr::null_mut(),
            )
        };
        if ret == CL_SUCCESS { src.len() } else { 0 }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::OpenCl
    }
}

impl Drop for OpenClBackend {
    fn drop(&mut self) {
        unsafe {
            if !self.queue.is_null() {
                (self.api.flush)(self.queue);
                (self.api.finish)(self.queue);
            }
            if !self.buffer.is_null() {
                (self.api.release_mem_object)(self.buffer);
            }
            if !self.queue.is_null() {
                (self.api.release_command_queue)(self.queue);
            }
            if !self.context.is_null() {
                (self.api.release_context)(self.context);
            }
        }
        self.buffer = std::ptr::null_mut();
        self.queue = std::ptr::null_mut();
        self.context = std::ptr::null_mut();
    }
}

pub(super) fn list_devices() -> Result<Vec<GpuDevice>, AllocationError> {
    let api = opencl()?;
    let mut found = Vec::new();

    for (platform_index, platform) in api.platforms()?.into_iter().enumerate() {
        let Some(platform_name) = api.platform_string(platform, CL_PLATFORM_NAME) else {
            continue;
        };
        let Some(devices) = api.devices(platform) else {
            continue;
        };

        for (device_index, device) in devices.into_iter().enumerate() {
            let Ok(memory_size) = api.device_u64(device, CL_DEVICE_GLOBAL_MEM_SIZE) else {
                continue;
            };
            let Ok(device_name) = api.device_string(device, CL_DEVICE_NAME) else {
                continue;
            };

            found.push(GpuDevice {
                selector: BackendSelector {
                    platform: platform_index,
                    device: device_index,
                },
                name: format!("{platform_name} - {device_name}"),
                memory_size,
            });
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_flags_by_vendor() {
        assert_eq!(
            buffer_flags("Advanced Micro Devices, Inc."),
            CL_MEM_READ_WRITE
        );
        assert_eq!(
            buffer_flags("NVIDIA Corporation"),
            CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR
        );
        assert_eq!(
            buffer_flags("Intel(R) Corporation"),
            CL_MEM_READ_WRITE | CL_MEM_ALLOC_HOST_PTR
        );
    }

    #[test]
    fn test_out_of_memory_codes() {
        assert!(is_out_of_memory(CL_MEM_OBJECT_ALLOCATION_FAILURE));
        assert!(is_out_of_memory(CL_INVALID_BUFFER_SIZE));
        assert!(!is_out_of_memory(-30));
    }

    #[test]
    fn test_buffer_error_mapping() {
        assert!(matches!(
            buffer_error(CL_MEM_OBJECT_ALLOCATION_FAILURE, 1 << 30),
            AllocationError::OutOfMemory {
                requested: 1073741824,
                free: None
            }
        ));
        assert!(matches!(
            buffer_error(CL_OUT_OF_RESOURCES, 4096),
            AllocationError::OutOfMemory { free: None, .. }
        ));
        assert!(matches!(
            buffer_error(-30, 4096),
            AllocationError::Api {
                call: "clCreateBuffer",
                code: -30
            }
        ));
    }

    /// Allocate on the first device, or `None` when this machine has no
    /// OpenCL runtime or device
    fn allocate_first(size: u64) -> Option<OpenClBackend> {
        match OpenClBackend::allocate(BackendSelector::default(), size) {
            Ok(backend) => Some(backend),
            Err(AllocationError::RuntimeUnavailable { .. })
            | Err(AllocationError::NoSuchDevice { .. })
            | Err(AllocationError::Api {
                call: "clGetPlatformIDs",
                ..
            }) => None,
            Err(e) => panic!("OpenCL allocation failed: {e}"),
        }
    }

    #[test]
    fn test_round_trip_on_device() {
        let Some(mut backend) = allocate_first(1 << 20) else {
            return;
        };
        assert_eq!(backend.kind(), BackendKind::OpenCl);
        assert_eq!(backend.size(), 1 << 20);

        let pattern: Vec<u8> = (0..4096).map(|i| (i * 13 % 256) as u8).collect();
        assert_eq!(backend.write(8192, &pattern), pattern.len());

        let mut out = vec![0u8; pattern.len()];
        assert_eq!(backend.read(8192, &mut out), pattern.len());
        assert_eq!(out, pattern);

        // last byte of the buffer
        assert_eq!(backend.write((1 << 20) - 1, &[0xA5]), 1);
        let mut last = [0u8; 1];
        assert_eq!(backend.read((1 << 20) - 1, &mut last), 1);
        assert_eq!(last, [0xA5]);
    }

    #[test]
    fn test_oversized_buffer_reports_out_of_memory() {
        if allocate_first(4096).is_none() {
            return;
        }
        let result = OpenClBackend::allocate(BackendSelector::default(), 1 << 50);
        assert!(matches!(
            result,
            Err(AllocationError::OutOfMemory { free: None, .. })
        ));
    }
}
