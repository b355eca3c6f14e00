//! CUDA driver API backend
//!
//! The driver library is loaded at runtime. CUDA contexts are bound to the
//! calling thread, so every call that touches device memory runs inside a
//! [`ContextScope`] that pushes the backend's context and pops it again on
//! every exit path.

use super::{BackendKind, BackendSelector, GpuDevice, MemoryBackend, c_name};
use crate::error::AllocationError;
use libloading::Library;
use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;
use tracing::{debug, warn};

type CUresult = c_int;
type CUdevice = c_int;
type CUcontext = *mut c_void;
type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;
const CUDA_ERROR_OUT_OF_MEMORY: CUresult = 2;

#[cfg(windows)]
const CUDA_LIBRARY: &str = "nvcuda.dll";
#[cfg(not(windows))]
const CUDA_LIBRARY: &str = "libcuda.so.1";

/// Entry points resolved from the CUDA driver library
struct CudaDriver {
    init: unsafe extern "system" fn(c_uint) -> CUresult,
    device_get_count: unsafe extern "system" fn(*mut c_int) -> CUresult,
    device_get: unsafe extern "system" fn(*mut CUdevice, c_int) -> CUresult,
    device_get_name: unsafe extern "system" fn(*mut c_char, c_int, CUdevice) -> CUresult,
    device_total_mem: unsafe extern "system" fn(*mut usize, CUdevice) -> CUresult,
    ctx_create: unsafe extern "system" fn(*mut CUcontext, c_uint, CUdevice) -> CUresult,
    ctx_destroy: unsafe extern "system" fn(CUcontext) -> CUresult,
    ctx_push_current: unsafe extern "system" fn(CUcontext) -> CUresult,
    ctx_pop_current: unsafe extern "system" fn(*mut CUcontext) -> CUresult,
    mem_alloc: unsafe extern "system" fn(*mut CUdeviceptr, usize) -> CUresult,
    mem_free: unsafe extern "system" fn(CUdeviceptr) -> CUresult,
    mem_get_info: unsafe extern "system" fn(*mut usize, *mut usize) -> CUresult,
    memcpy_htod: unsafe extern "system" fn(CUdeviceptr, *const c_void, usize) -> CUresult,
    memcpy_dtoh: unsafe extern "system" fn(*mut c_void, CUdeviceptr, usize) -> CUresult,
    _library: Library,
}

/// Copy a function pointer out of the library
unsafe fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, libloading::Error> {
    Ok(unsafe { *library.get::<T>(name)? })
}

impl CudaDriver {
    fn load() -> Result<Self, libloading::Error> {
        unsafe {
            let library = Library::new(CUDA_LIBRARY)?;
            Ok(Self {
                init: symbol(&library, b"cuInit\0")?,
                device_get_count: symbol(&library, b"cuDeviceGetCount\0")?,
                device_get: symbol(&library, b"cuDeviceGet\0")?,
                device_get_name: symbol(&library, b"cuDeviceGetName\0")?,
                device_total_mem: symbol(&library, b"cuDeviceTotalMem_v2\0")?,
                ctx_create: symbol(&library, b"cuCtxCreate_v2\0")?,
                ctx_destroy: symbol(&library, b"cuCtxDestroy_v2\0")?,
                ctx_push_current: symbol(&library, b"cuCtxPushCurrent_v2\0")?,
                ctx_pop_current: symbol(&library, b"cuCtxPopCurrent_v2\0")?,
                mem_alloc: symbol(&library, b"cuMemAlloc_v2\0")?,
                mem_free: symbol(&library, b"cuMemFree_v2\0")?,
                mem_get_info: symbol(&library, b"cuMemGetInfo_v2\0")?,
                memcpy_htod: symbol(&library, b"cuMemcpyHtoD_v2\0")?,
                memcpy_dtoh: symbol(&library, b"cuMemcpyDtoH_v2\0")?,
                _library: library,
            })
        }
    }
}

/// Loaded and initialized driver, shared by every CUDA backend in the process
fn driver() -> Result<&'static CudaDriver, AllocationError> {
    static DRIVER: OnceLock<Result<CudaDriver, String>> = OnceLock::new();

    let loaded = DRIVER.get_or_init(|| {
        let driver = CudaDriver::load().map_err(|e| e.to_string())?;
        let res = unsafe { (driver.init)(0) };
        if res != CUDA_SUCCESS {
            return Err(format!("cuInit failed with error code {res}"));
        }
        Ok(driver)
    });

    loaded
        .as_ref()
        .map_err(|reason| AllocationError::RuntimeUnavailable {
            api: "CUDA",
            reason: reason.clone(),
        })
}

fn check(call: &'static str, res: CUresult) -> Result<(), AllocationError> {
    if res == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(AllocationError::Api {
            call,
            code: i64::from(res),
        })
    }
}

/// Context pushed on the current thread for the lifetime of the scope
struct ContextScope<'a> {
    driver: &'a CudaDriver,
}

impl<'a> ContextScope<'a> {
    fn enter(driver: &'a CudaDriver, context: CUcontext) -> Result<Self, CUresult> {
        let res = unsafe { (driver.ctx_push_current)(context) };
        if res != CUDA_SUCCESS {
            return Err(res);
        }
        Ok(Self { driver })
    }
}

impl Drop for ContextScope<'_> {
    fn drop(&mut self) {
        let mut popped: CUcontext = std::ptr::null_mut();
        unsafe {
            (self.driver.ctx_pop_current)(&mut popped);
        }
    }
}

/// Disk held in CUDA device memory
pub struct CudaBackend {
    driver: &'static CudaDriver,
    context: CUcontext,
    device_ptr: CUdeviceptr,
    size: u64,
}

// SAFETY: a CUDA context may be used from any thread once pushed there; every
// access goes through ContextScope.
unsafe impl Send for CudaBackend {}

impl CudaBackend {
    pub fn allocate(selector: BackendSelector, size: u64) -> Result<Self, AllocationError> {
        let driver = driver()?;
        let bytes = usize::try_from(size).map_err(|_| AllocationError::OutOfMemory {
            requested: size,
            free: None,
        })?;

        let device = device_handle(driver, selector)?;

        // cuCtxCreate leaves the new context current; pop it straight away so
        // the thread is left the way we found it
        let mut context: CUcontext = std::ptr::null_mut();
        check("cuCtxCreate", unsafe {
            (driver.ctx_create)(&mut context, 0, device)
        })?;
        let mut popped: CUcontext = std::ptr::null_mut();
        unsafe {
            (driver.ctx_pop_current)(&mut popped);
        }

        let mut backend = Self {
            driver,
            context,
            device_ptr: 0,
            size,
        };

        let scope = ContextScope::enter(driver, context).map_err(|code| AllocationError::Api {
            call: "cuCtxPushCurrent",
            code: i64::from(code),
        })?;

        let mut device_ptr: CUdeviceptr = 0;
        let res = unsafe { (driver.mem_alloc)(&mut device_ptr, bytes) };
        if res == CUDA_ERROR_OUT_OF_MEMORY {
            let (mut free, mut total) = (0usize, 0usize);
            let info = unsafe { (driver.mem_get_info)(&mut free, &mut total) };
            let free = (info == CUDA_SUCCESS).then_some(free as u64);
            debug!(?free, total, "CUDA device out of memory");
            drop(scope);
            return Err(AllocationError::OutOfMemory {
                requested: size,
                free,
            });
        }
        check("cuMemAlloc", res)?;
        drop(scope);

        backend.device_ptr = device_ptr;
        Ok(backend)
    }
}

impl MemoryBackend for CudaBackend {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, dst: &mut [u8]) -> usize {
        let Ok(_scope) = ContextScope::enter(self.driver, self.context) else {
            return 0;
        };
        let res = unsafe {
            (self.driver.memcpy_dtoh)(
                dst.as_mut_ptr() as *mut c_void,
                self.device_ptr + offset,
                dst.len(),
            )
        };
        if res == CUDA_SUCCESS { dst.len() } else { 0 }
    }

    fn write(&mut self, offset: u64, src: &[u8]) -> usize {
        let Ok(_scope) = ContextScope::enter(self.driver, self.context) else {
            return 0;
        };
        let res = unsafe {
            (self.driver.memcpy_htod)(
                self.device_ptr + offset,
                src.as_ptr() as *const c_void,
                src.len(),
            )
        };
        if res == CUDA_SUCCESS { src.len() } else { 0 }
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        if self.device_ptr != 0 {
            match ContextScope::enter(self.driver, self.context) {
                Ok(_scope) => {
                    unsafe { (self.driver.mem_free)(self.device_ptr) };
                }
                Err(code) => warn!(code, "unable to push CUDA context to free device memory"),
            }
            self.device_ptr = 0;
        }
        if !self.context.is_null() {
            unsafe {
                (self.driver.ctx_destroy)(self.context);
            }
            self.context = std::ptr::null_mut();
        }
    }
}

fn device_handle(
    driver: &CudaDriver,
    selector: BackendSelector,
) -> Result<CUdevice, AllocationError> {
    let no_such_device = AllocationError::NoSuchDevice {
        platform: selector.platform,
        device: selector.device,
    };
    if selector.platform != 0 {
        return Err(no_such_device);
    }
    let ordinal = c_int::try_from(selector.device).map_err(|_| {
        AllocationError::NoSuchDevice {
            platform: selector.platform,
            device: selector.device,
        }
    })?;

    let mut count: c_int = 0;
    check("cuDeviceGetCount", unsafe {
        (driver.device_get_count)(&mut count)
    })?;
    if ordinal >= count {
        return Err(no_such_device);
    }

    let mut device: CUdevice = 0;
    check("cuDeviceGet", unsafe {
        (driver.device_get)(&mut device, ordinal)
    })?;
    Ok(device)
}

pub(super) fn list_devices() -> Result<Vec<GpuDevice>, AllocationError> {
    let driver = driver()?;

    let mut count: c_int = 0;
    check("cuDeviceGetCount", unsafe {
        (driver.device_get_count)(&mut count)
    })?;

    let mut devices = Vec::new();
    for ordinal in 0..count {
        let mut device: CUdevice = 0;
        if unsafe { (driver.device_get)(&mut device, ordinal) } != CUDA_SUCCESS {
            continue;
        }

        let mut name = [0u8; 64];
        let mut memory: usize = 0;
        unsafe {
            (driver.device_get_name)(name.as_mut_ptr() as *mut c_char, name.len() as c_int, device);
            (driver.device_total_mem)(&mut memory, device);
        }

        devices.push(GpuDevice {
            selector: BackendSelector {
                platform: 0,
                device: ordinal as usize,
            },
            name: c_name(&name),
            memory_size: memory as u64,
        });
    }

    Ok(devices)
}
