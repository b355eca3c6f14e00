//! Pointing TEMP/TMP at a folder on the mounted volume

use crate::error::EnvironmentError;
use crate::volume::volume_root;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Variables redirected to the volume
pub const TEMP_VARIABLES: [&str; 2] = ["TEMP", "TMP"];

/// Persistent user environment variables
pub trait EnvironmentStore: Send + Sync {
    /// Current value, `None` if unset
    fn get(&self, name: &str) -> Result<Option<String>, EnvironmentError>;

    /// Set a value, or remove it with `None`
    fn set(&self, name: &str, value: Option<&str>) -> Result<(), EnvironmentError>;
}

/// Environment of the current process only
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl EnvironmentStore for ProcessEnvironment {
    fn get(&self, name: &str) -> Result<Option<String>, EnvironmentError> {
        Ok(std::env::var(name).ok())
    }

    fn set(&self, name: &str, value: Option<&str>) -> Result<(), EnvironmentError> {
        // SAFETY: TEMP/TMP are only changed by the drive controller, which is
        // driven from a single thread.
        unsafe {
            match value {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
        Ok(())
    }
}

/// User environment in `HKEY_CURRENT_USER\Environment`
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryEnvironment;

#[cfg(windows)]
impl RegistryEnvironment {
    const KEY: windows::core::PCWSTR = windows::core::w!("Environment");

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }
}

#[cfg(windows)]
impl EnvironmentStore for RegistryEnvironment {
    fn get(&self, name: &str) -> Result<Option<String>, EnvironmentError> {
        use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
        use windows::Win32::System::Registry::{
            HKEY_CURRENT_USER, RRF_NOEXPAND, RRF_RT_REG_EXPAND_SZ, RRF_RT_REG_SZ, RegGetValueW,
        };
        use windows::core::PCWSTR;

        let value_name = Self::wide(name);
        let flags = RRF_RT_REG_SZ | RRF_RT_REG_EXPAND_SZ | RRF_NOEXPAND;

        let mut size: u32 = 0;
        let status = unsafe {
            RegGetValueW(
                HKEY_CURRENT_USER,
                Self::KEY,
                PCWSTR(value_name.as_ptr()),
                flags,
                None,
                None,
                Some(&mut size as *mut u32),
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(None);
        }
        if status != ERROR_SUCCESS {
            return Err(EnvironmentError::Store {
                name: name.to_string(),
                code: status.0,
            });
        }

        let mut data = vec![0u16; (size as usize).div_ceil(2)];
        let status = unsafe {
            RegGetValueW(
                HKEY_CURRENT_USER,
                Self::KEY,
                PCWSTR(value_name.as_ptr()),
                flags,
                None,
                Some(data.as_mut_ptr().cast()),
                Some(&mut size as *mut u32),
            )
        };
        if status != ERROR_SUCCESS {
            return Err(EnvironmentError::Store {
                name: name.to_string(),
                code: status.0,
            });
        }

        let len = data.iter().position(|&c| c == 0).unwrap_or(data.len());
        Ok(Some(String::from_utf16_lossy(&data[..len])))
    }

    fn set(&self, name: &str, value: Option<&str>) -> Result<(), EnvironmentError> {
        use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS};
        use windows::Win32::System::Registry::{
            HKEY_CURRENT_USER, REG_EXPAND_SZ, RegDeleteKeyValueW, RegSetKeyValueW,
        };
        use windows::core::PCWSTR;

        let value_name = Self::wide(name);
        let status = match value {
            Some(value) => {
                let data = Self::wide(value);
                unsafe {
                    RegSetKeyValueW(
                        HKEY_CURRENT_USER,
                        Self::KEY,
                        PCWSTR(value_name.as_ptr()),
                        REG_EXPAND_SZ.0,
                        Some(data.as_ptr().cast()),
                        (data.len() * 2) as u32,
                    )
                }
            }
            None => unsafe {
                RegDeleteKeyValueW(HKEY_CURRENT_USER, Self::KEY, PCWSTR(value_name.as_ptr()))
            },
        };

        if status == ERROR_SUCCESS || (value.is_none() && status == ERROR_FILE_NOT_FOUND) {
            Ok(())
        } else {
            Err(EnvironmentError::Store {
                name: name.to_string(),
                code: status.0,
            })
        }
    }
}

/// Store used by default on this platform
pub fn default_store() -> Box<dyn EnvironmentStore> {
    #[cfg(windows)]
    {
        Box::new(RegistryEnvironment)
    }
    #[cfg(not(windows))]
    {
        Box::new(ProcessEnvironment)
    }
}

/// Temp folder on a mounted volume
pub fn temp_folder(mount_point: &str) -> PathBuf {
    Path::new(&volume_root(mount_point)).join("Temp")
}

/// An applied redirection, holding the values to put back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempRedirect {
    folder: PathBuf,
    saved: Vec<(String, Option<String>)>,
}

impl TempRedirect {
    /// Create the temp folder on the volume and point TEMP/TMP at it
    pub fn apply(store: &dyn EnvironmentStore, mount_point: &str) -> Result<Self, EnvironmentError> {
        let folder = temp_folder(mount_point);
        std::fs::create_dir_all(&folder)?;

        let mut saved = Vec::with_capacity(TEMP_VARIABLES.len());
        for name in TEMP_VARIABLES {
            saved.push((name.to_string(), store.get(name)?));
        }

        let redirect = Self { folder, saved };
        let target = redirect.folder.to_string_lossy().into_owned();
        for name in TEMP_VARIABLES {
            if let Err(e) = store.set(name, Some(&target)) {
                // put back whatever was already changed
                redirect.restore(store).ok();
                return Err(e);
            }
        }

        info!(folder = %redirect.folder.display(), "temp folder redirected");
        Ok(redirect)
    }

    /// Folder TEMP/TMP point at
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Put the recorded values back. Every variable is attempted; the first
    /// failure is returned.
    pub fn restore(&self, store: &dyn EnvironmentStore) -> Result<(), EnvironmentError> {
        let mut first_error = None;
        for (name, value) in &self.saved {
            if let Err(e) = store.set(name, value.as_deref()) {
                warn!(name = %name, error = %e, "unable to restore environment variable");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("temp folder restored");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        values: Mutex<HashMap<String, String>>,
        fail_on: Option<&'static str>,
    }

    impl EnvironmentStore for MemoryStore {
        fn get(&self, name: &str) -> Result<Option<String>, EnvironmentError> {
            Ok(self.values.lock().unwrap().get(name).cloned())
        }

        fn set(&self, name: &str, value: Option<&str>) -> Result<(), EnvironmentError> {
            if self.fail_on == Some(name) && value.is_some() {
                return Err(EnvironmentError::Store {
                    name: name.to_string(),
                    code: 5,
                });
            }
            let mut values = self.values.lock().unwrap();
            match value {
                Some(v) => values.insert(name.to_string(), v.to_string()),
                None => values.remove(name),
            };
            Ok(())
        }
    }

    #[test]
    fn test_temp_folder_path() {
        assert_eq!(temp_folder("/mnt/ram"), PathBuf::from("/mnt/ram/Temp"));
    }

    #[test]
    fn test_apply_and_restore() {
        let volume = tempfile::tempdir().unwrap();
        let mount = volume.path().to_string_lossy().into_owned();
        let store = MemoryStore::default();
        store.set("TEMP", Some("C:\\Users\\me\\Temp")).unwrap();

        let redirect = TempRedirect::apply(&store, &mount).unwrap();
        assert!(redirect.folder().is_dir());
        let target = redirect.folder().to_string_lossy().into_owned();
        assert_eq!(store.get("TEMP").unwrap().as_deref(), Some(target.as_str()));
        assert_eq!(store.get("TMP").unwrap().as_deref(), Some(target.as_str()));

        redirect.restore(&store).unwrap();
        assert_eq!(
            store.get("TEMP").unwrap().as_deref(),
            Some("C:\\Users\\me\\Temp")
        );
        assert_eq!(store.get("TMP").unwrap(), None);
    }

    #[test]
    fn test_failed_apply_leaves_environment_unchanged() {
        let volume = tempfile::tempdir().unwrap();
        let mount = volume.path().to_string_lossy().into_owned();
        let store = MemoryStore {
            fail_on: Some("TMP"),
            ..Default::default()
        };
        store.set("TEMP", Some("old")).unwrap();

        assert!(TempRedirect::apply(&store, &mount).is_err());
        assert_eq!(store.get("TEMP").unwrap().as_deref(), Some("old"));
        assert_eq!(store.get("TMP").unwrap(), None);
    }
}
