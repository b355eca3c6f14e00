//! Named objects in the Windows object namespace

use crate::channel::{ChannelError, Namespace, ServerLock, SharedMapping, Signal};
use std::sync::Arc;
use std::time::Duration;
use windows::Win32::Foundation::{
    CloseHandle, ERROR_ALREADY_EXISTS, GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
    WAIT_TIMEOUT, WIN32_ERROR,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
    OpenFileMappingW, PAGE_READWRITE, SEC_COMMIT, UnmapViewOfFile, VirtualQuery,
    MEMORY_BASIC_INFORMATION,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, EVENT_ALL_ACCESS, INFINITE, OpenEventW, ReleaseMutex, SetEvent,
    WaitForSingleObject,
};
use windows::core::PCWSTR;

/// Namespace backed by real Windows kernel objects
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32Namespace;

fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error() -> u32 {
    unsafe { GetLastError().0 }
}

/// Win32 error code carried by a `windows` error (which holds an HRESULT)
fn os_code(error: &windows::core::Error) -> u32 {
    WIN32_ERROR::from_error(error)
        .map(|code| code.0)
        .unwrap_or(error.code().0 as u32)
}

/// Owned kernel handle, closed on drop
struct OwnedHandle(HANDLE);

// SAFETY: kernel handles are process-wide and usable from any thread
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

struct Win32Mapping {
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
    _section: OwnedHandle,
}

// SAFETY: the view is valid for the whole process until unmapped in drop
unsafe impl Send for Win32Mapping {}

impl Win32Mapping {
    fn map(section: OwnedHandle, name: &str) -> Result<Self, ChannelError> {
        unsafe {
            let view = MapViewOfFile(section.0, FILE_MAP_READ | FILE_MAP_WRITE, 0, 0, 0);
            if view.Value.is_null() {
                return Err(ChannelError::Mapping {
                    name: name.to_string(),
                    code: last_error(),
                });
            }

            let mut info = MEMORY_BASIC_INFORMATION::default();
            let queried = VirtualQuery(
                Some(view.Value),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            if queried == 0 {
                let code = last_error();
                let _ = UnmapViewOfFile(view);
                return Err(ChannelError::Mapping {
                    name: name.to_string(),
                    code,
                });
            }

            Ok(Self {
                view,
                len: info.RegionSize,
                _section: section,
            })
        }
    }
}

impl SharedMapping for Win32Mapping {
    fn base(&self) -> *mut u8 {
        self.view.Value as *mut u8
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Win32Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}

struct Win32ServerLock(OwnedHandle);

impl ServerLock for Win32ServerLock {}

impl Drop for Win32ServerLock {
    fn drop(&mut self) {
        unsafe {
            let _ = ReleaseMutex((self.0).0);
        }
    }
}

struct Win32Event {
    name: String,
    handle: OwnedHandle,
}

impl Signal for Win32Event {
    fn wait(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let millis = timeout
            .map(|t| t.as_millis().min(u128::from(INFINITE - 1)) as u32)
            .unwrap_or(INFINITE);
        let result = unsafe { WaitForSingleObject(self.handle.0, millis) };
        if result == WAIT_OBJECT_0 {
            Ok(())
        } else if result == WAIT_TIMEOUT {
            Err(ChannelError::Timeout(self.name.clone()))
        } else {
            Err(ChannelError::Wait {
                name: self.name.clone(),
                code: last_error(),
            })
        }
    }

    fn set(&self) -> Result<(), ChannelError> {
        unsafe { SetEvent(self.handle.0) }.map_err(|e| ChannelError::Signal {
            name: self.name.clone(),
            code: os_code(&e),
        })
    }
}

impl Namespace for Win32Namespace {
    fn create_mapping(
        &self,
        name: &str,
        size: usize,
    ) -> Result<Box<dyn SharedMapping>, ChannelError> {
        let name_wide = wide(name);
        let size = size as u64;

        unsafe {
            let section = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE | SEC_COMMIT,
                (size >> 32) as u32,
                size as u32,
                PCWSTR(name_wide.as_ptr()),
            );
            let already_exists = GetLastError() == ERROR_ALREADY_EXISTS;

            let section = OwnedHandle(section.map_err(|e| ChannelError::Mapping {
                name: name.to_string(),
                code: os_code(&e),
            })?);

            // An existing section means another server, or ImDisk still
            // holding the previous one open
            if already_exists {
                return Err(ChannelError::AlreadyRunning(name.to_string()));
            }

            Ok(Box::new(Win32Mapping::map(section, name)?))
        }
    }

    fn create_server_lock(&self, name: &str) -> Result<Box<dyn ServerLock>, ChannelError> {
        let name_wide = wide(name);

        unsafe {
            let mutex = CreateMutexW(None, false, PCWSTR(name_wide.as_ptr())).map_err(|e| {
                ChannelError::SyncObject {
                    kind: "mutex",
                    name: name.to_string(),
                    code: os_code(&e),
                }
            })?;
            let mutex = OwnedHandle(mutex);

            if WaitForSingleObject(mutex.0, 0) != WAIT_OBJECT_0 {
                return Err(ChannelError::AlreadyRunning(name.to_string()));
            }

            Ok(Box::new(Win32ServerLock(mutex)))
        }
    }

    fn create_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError> {
        let name_wide = wide(name);

        let event = unsafe { CreateEventW(None, false, false, PCWSTR(name_wide.as_ptr())) }
            .map_err(|e| ChannelError::SyncObject {
                kind: "event",
                name: name.to_string(),
                code: os_code(&e),
            })?;

        Ok(Arc::new(Win32Event {
            name: name.to_string(),
            handle: OwnedHandle(event),
        }))
    }

    fn open_mapping(&self, name: &str) -> Result<Box<dyn SharedMapping>, ChannelError> {
        let name_wide = wide(name);

        let section = unsafe {
            OpenFileMappingW(
                (FILE_MAP_READ | FILE_MAP_WRITE).0,
                false,
                PCWSTR(name_wide.as_ptr()),
            )
        }
        .map_err(|_| ChannelError::NotFound(name.to_string()))?;

        Ok(Box::new(Win32Mapping::map(OwnedHandle(section), name)?))
    }

    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError> {
        let name_wide = wide(name);

        let event = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, PCWSTR(name_wide.as_ptr())) }
            .map_err(|_| ChannelError::NotFound(name.to_string()))?;

        Ok(Arc::new(Win32Event {
            name: name.to_string(),
            handle: OwnedHandle(event),
        }))
    }
}
