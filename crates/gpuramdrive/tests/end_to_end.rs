//! Full mount cycle against an in-process driver that speaks the proxy
//! protocol the way ImDisk does.

use gpuramdrive::{
    DeviceRegistration, DriveDescriptor, DriveState, DriveType, DriverError, RamDrive,
    VirtualDiskDriver,
};
use gpuramdrive_shared::{
    LocalNamespace, ProxyClient, ProxyRequest, REQUEST_BUFFER_SIZE, RequestCode, TransferResponse,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Opens the channel on create, sends CLOSE when the device is removed
#[derive(Default)]
struct LoopbackDriver {
    client: Mutex<Option<ProxyClient>>,
    removed: Mutex<Vec<u32>>,
}

impl LoopbackDriver {
    fn with_client<T>(&self, f: impl FnOnce(&mut ProxyClient) -> T) -> T {
        let mut guard = self.client.lock().unwrap();
        f(guard.as_mut().expect("device not created"))
    }
}

impl VirtualDiskDriver for LoopbackDriver {
    fn create_device(&self, registration: &mut DeviceRegistration) -> Result<(), DriverError> {
        let fail = |_| DriverError::CreateFailed {
            mount_point: registration.mount_point.clone(),
            code: 2,
        };
        let mut client = ProxyClient::open(&LocalNamespace, &registration.service_name).map_err(fail)?;
        client.info().map_err(fail)?;

        registration.device_id = 0;
        *self.client.lock().unwrap() = Some(client);
        Ok(())
    }

    fn force_remove_device(&self, device_id: u32) -> Result<(), DriverError> {
        if let Some(mut client) = self.client.lock().unwrap().take() {
            client.close().ok();
        }
        self.removed.lock().unwrap().push(device_id);
        Ok(())
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn test_mount_serve_close_unmount() {
    let driver = Arc::new(LoopbackDriver::default());
    let mut drive = RamDrive::new(driver.clone(), Arc::new(LocalNamespace));
    assert!(!drive.is_mounted());

    let mut descriptor = DriveDescriptor::new(16 * 1024 * 1024, "R:");
    descriptor.drive_type = DriveType::Hd;
    descriptor.service_name = "TestDrv".into();
    drive.create(descriptor).unwrap();
    assert!(drive.is_mounted());
    assert_eq!(drive.state(), DriveState::Serving);

    let info = driver.with_client(|c| c.info()).unwrap();
    assert_eq!(info.file_size, 16 * 1024 * 1024);
    assert_eq!(info.req_alignment, 1);

    let pattern: Vec<u8> = (0..512).map(|i| (i * 7 % 251) as u8).collect();
    let written = driver.with_client(|c| c.write(0, &pattern)).unwrap();
    assert_eq!(written, 512);

    let read = driver.with_client(|c| c.read(0, 512)).unwrap();
    assert_eq!(read, pattern);

    driver.with_client(|c| c.close()).unwrap();
    assert!(wait_until(|| !drive.is_mounted()));

    drive.unmount();
    assert!(!drive.is_mounted());
    assert_eq!(drive.state(), DriveState::Idle);
    assert_eq!(*driver.removed.lock().unwrap(), vec![0]);
}

#[test]
fn test_oversized_request_is_clamped() {
    let driver = Arc::new(LoopbackDriver::default());
    let mut drive = RamDrive::new(driver.clone(), Arc::new(LocalNamespace));

    let mut descriptor = DriveDescriptor::new(8 << 20, "S:");
    descriptor.service_name = "ClampDrv".into();
    drive.create(descriptor).unwrap();

    let buffer_size = REQUEST_BUFFER_SIZE as u64;
    let send = |length| {
        let raw = driver
            .with_client(|c| c.send(ProxyRequest::new(RequestCode::Read, 0, length)))
            .unwrap();
        TransferResponse::from_bytes(&raw).unwrap()
    };
    assert_eq!(send(buffer_size + 1), send(buffer_size));
    assert_eq!(send(buffer_size + 1).length, buffer_size);

    drive.unmount();
    assert!(!drive.is_mounted());
    assert_eq!(*driver.removed.lock().unwrap(), vec![0]);
}

#[test]
fn test_unmount_without_driver_close() {
    let driver = Arc::new(LoopbackDriver::default());
    let mut drive = RamDrive::new(driver.clone(), Arc::new(LocalNamespace));

    let mut descriptor = DriveDescriptor::new(1 << 20, "T:");
    descriptor.service_name = "QuietDrv".into();
    drive.create(descriptor).unwrap();

    // removal sends CLOSE; the worker is joined either way
    drive.unmount();
    assert!(!drive.is_mounted());

    // the service name is free again
    let mut again = DriveDescriptor::new(1 << 20, "T:");
    again.service_name = "QuietDrv".into();
    drive.create(again).unwrap();
    assert!(drive.is_mounted());
}
