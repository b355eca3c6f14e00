//! Virtual disk driver control
//!
//! The controller only needs two calls from the kernel driver: register a
//! proxy device for a service name, and force it away again.

#[cfg(windows)]
mod imdisk;

#[cfg(windows)]
pub use imdisk::ImDiskDriver;

use crate::config::{DriveDescriptor, DriveType};
use crate::error::DriverError;

/// Let the driver pick the device number
pub const AUTO_DEVICE_NUMBER: u32 = u32::MAX;

/// Device is read-only
pub const OPTION_RO: u32 = 0x1;
/// Device is reported as removable media
pub const OPTION_REMOVABLE: u32 = 0x8;
/// Storage is served by a user-mode proxy
pub const TYPE_PROXY: u32 = 0x300;
/// Proxy transport is a shared memory section
pub const PROXY_TYPE_SHM: u32 = 0x3000;

/// Flags word for a shared memory proxy device
pub fn registration_flags(drive_type: DriveType, removable: bool, read_only: bool) -> u32 {
    let mut flags = TYPE_PROXY | PROXY_TYPE_SHM | drive_type.flags();
    if removable {
        flags |= OPTION_REMOVABLE;
    }
    if read_only {
        flags |= OPTION_RO;
    }
    flags
}

/// Parameters for one device registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRegistration {
    /// In: requested number or [`AUTO_DEVICE_NUMBER`]. Out: assigned number.
    pub device_id: u32,
    pub flags: u32,
    /// Name the driver uses to open the shared memory channel
    pub service_name: String,
    pub mount_point: String,
}

impl DeviceRegistration {
    pub fn for_descriptor(descriptor: &DriveDescriptor) -> Self {
        Self {
            device_id: AUTO_DEVICE_NUMBER,
            flags: registration_flags(descriptor.drive_type, descriptor.removable, false),
            service_name: descriptor.service_name.clone(),
            mount_point: descriptor.mount_point.clone(),
        }
    }
}

/// Kernel driver that exposes proxy devices to the storage stack
pub trait VirtualDiskDriver: Send + Sync {
    /// Create and mount a device. `registration.device_id` is updated as soon
    /// as the driver assigns a number, including when creation then fails.
    fn create_device(&self, registration: &mut DeviceRegistration) -> Result<(), DriverError>;

    /// Remove a device unconditionally, dismounting its volume
    fn force_remove_device(&self, device_id: u32) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_flags() {
        assert_eq!(registration_flags(DriveType::Hd, false, false), 0x3310);
        assert_eq!(registration_flags(DriveType::Fd, true, false), 0x3328);
        assert_eq!(registration_flags(DriveType::Cd, false, true), 0x3331);
        assert_eq!(registration_flags(DriveType::Raw, false, false), 0x3340);
    }

    #[test]
    fn test_registration_for_descriptor() {
        let mut descriptor = DriveDescriptor::new(16 << 20, "R:");
        descriptor.removable = true;
        descriptor.service_name = "TestDrv".into();

        let registration = DeviceRegistration::for_descriptor(&descriptor);
        assert_eq!(registration.device_id, AUTO_DEVICE_NUMBER);
        assert_eq!(registration.flags, TYPE_PROXY | PROXY_TYPE_SHM | 0x10 | OPTION_REMOVABLE);
        assert_eq!(registration.service_name, "TestDrv");
        assert_eq!(registration.mount_point, "R:");
    }
}
