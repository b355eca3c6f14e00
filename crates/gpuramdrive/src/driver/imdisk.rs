//! ImDisk control API, loaded from the control panel applet

use super::{DeviceRegistration, VirtualDiskDriver};
use crate::error::DriverError;
use libloading::Library;
use std::ffi::c_void;
use tracing::{debug, info};
use windows::Win32::Foundation::GetLastError;

const IMDISK_LIBRARY: &str = "imdisk.cpl";

/// Dismount volumes even when files on them are open
const IMDISK_API_FORCE_DISMOUNT: u64 = 0x2;

/// Geometry passed at creation; all zero lets the driver derive it
#[repr(C)]
#[derive(Default)]
struct DiskGeometry {
    cylinders: i64,
    media_type: i32,
    tracks_per_cylinder: u32,
    sectors_per_track: u32,
    bytes_per_sector: u32,
}

type CreateDeviceEx = unsafe extern "system" fn(
    *mut c_void,
    *mut u32,
    *mut DiskGeometry,
    *mut i64,
    u32,
    *const u16,
    i32,
    *mut u16,
) -> i32;
type ForceRemoveDevice = unsafe extern "system" fn(*mut c_void, u32) -> i32;
type SetApiFlags = unsafe extern "system" fn(u64) -> u64;

/// ImDisk virtual disk driver
pub struct ImDiskDriver {
    create_device_ex: CreateDeviceEx,
    force_remove_device: ForceRemoveDevice,
    _library: Library,
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> u32 {
    unsafe { GetLastError().0 }
}

impl ImDiskDriver {
    /// Load the ImDisk API and enable forced dismounts
    pub fn load() -> Result<Self, DriverError> {
        unsafe {
            let library =
                Library::new(IMDISK_LIBRARY).map_err(|e| DriverError::Unavailable(e.to_string()))?;
            let unavailable = |e: libloading::Error| DriverError::Unavailable(e.to_string());

            let create_device_ex: CreateDeviceEx =
                *library.get::<CreateDeviceEx>(b"ImDiskCreateDeviceEx\0").map_err(unavailable)?;
            let force_remove_device: ForceRemoveDevice =
                *library.get::<ForceRemoveDevice>(b"ImDiskForceRemoveDevice\0").map_err(unavailable)?;
            let set_api_flags: SetApiFlags =
                *library.get::<SetApiFlags>(b"ImDiskSetAPIFlags\0").map_err(unavailable)?;

            set_api_flags(IMDISK_API_FORCE_DISMOUNT);
            debug!("ImDisk API loaded");

            Ok(Self {
                create_device_ex,
                force_remove_device,
                _library: library,
            })
        }
    }
}

impl VirtualDiskDriver for ImDiskDriver {
    fn create_device(&self, registration: &mut DeviceRegistration) -> Result<(), DriverError> {
        let service = wide(&registration.service_name);
        let mut mount_point = wide(&registration.mount_point);
        let mut geometry = DiskGeometry::default();

        let ok = unsafe {
            (self.create_device_ex)(
                std::ptr::null_mut(),
                &mut registration.device_id,
                &mut geometry,
                std::ptr::null_mut(),
                registration.flags,
                service.as_ptr(),
                0,
                mount_point.as_mut_ptr(),
            )
        };
        if ok == 0 {
            return Err(DriverError::CreateFailed {
                mount_point: registration.mount_point.clone(),
                code: last_error(),
            });
        }

        info!(
            device_id = registration.device_id,
            mount_point = %registration.mount_point,
            "ImDisk device created"
        );
        Ok(())
    }

    fn force_remove_device(&self, device_id: u32) -> Result<(), DriverError> {
        let ok = unsafe { (self.force_remove_device)(std::ptr::null_mut(), device_id) };
        if ok == 0 {
            return Err(DriverError::RemoveFailed {
                device_id,
                code: last_error(),
            });
        }
        Ok(())
    }
}
