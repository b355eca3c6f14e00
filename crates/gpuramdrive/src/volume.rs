//! Preparing a freshly mounted volume: format utility and volume label

use crate::error::VolumeError;
use std::process::Command;
use tracing::{debug, info};

/// Utility invoked to put a filesystem on the new volume
pub const FORMAT_UTILITY: &str = "format.com";

/// Formatting and labelling of mounted volumes
pub trait VolumeTools: Send + Sync {
    /// Run the format utility on `mount_point` and wait for it to exit
    fn format(&self, mount_point: &str, params: &str) -> Result<(), VolumeError>;

    /// Set the label of the volume mounted at `mount_point`
    fn set_label(&self, mount_point: &str, label: &str) -> Result<(), VolumeError>;
}

/// Arguments for the format utility. The unattended switch is appended
/// unless the caller already passed it.
pub fn format_arguments(mount_point: &str, params: &str) -> Vec<String> {
    let mut args = vec![mount_point.to_string()];
    args.extend(params.split_whitespace().map(str::to_string));
    if !args.iter().any(|a| a.eq_ignore_ascii_case("/y")) {
        args.push("/y".to_string());
    }
    args
}

/// Root directory of a mount point ("R:" becomes "R:\")
pub fn volume_root(mount_point: &str) -> String {
    if mount_point.ends_with(':') {
        format!("{mount_point}\\")
    } else {
        mount_point.to_string()
    }
}

/// Tools provided by the operating system
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemVolumeTools;

impl VolumeTools for SystemVolumeTools {
    fn format(&self, mount_point: &str, params: &str) -> Result<(), VolumeError> {
        let args = format_arguments(mount_point, params);
        info!(mount_point, args = ?args, "formatting volume");

        let mut command = Command::new(FORMAT_UTILITY);
        command.args(&args);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let status = command.status()?;
        debug!(%status, "format utility exited");
        if status.success() {
            Ok(())
        } else {
            Err(VolumeError::FormatFailed(status.to_string()))
        }
    }

    #[cfg(windows)]
    fn set_label(&self, mount_point: &str, label: &str) -> Result<(), VolumeError> {
        use windows::Win32::Foundation::GetLastError;
        use windows::Win32::Storage::FileSystem::SetVolumeLabelW;
        use windows::core::PCWSTR;

        let root: Vec<u16> = volume_root(mount_point)
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let name: Vec<u16> = label.encode_utf16().chain(std::iter::once(0)).collect();

        info!(mount_point, label, "setting volume label");
        unsafe { SetVolumeLabelW(PCWSTR(root.as_ptr()), PCWSTR(name.as_ptr())) }.map_err(|_| {
            VolumeError::Label {
                mount_point: mount_point.to_string(),
                code: unsafe { GetLastError().0 },
            }
        })
    }

    #[cfg(not(windows))]
    fn set_label(&self, _mount_point: &str, _label: &str) -> Result<(), VolumeError> {
        Err(VolumeError::Unsupported("setting a volume label"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_arguments_append_unattended() {
        assert_eq!(
            format_arguments("R:", "/fs:ntfs /q"),
            vec!["R:", "/fs:ntfs", "/q", "/y"]
        );
        assert_eq!(format_arguments("R:", ""), vec!["R:", "/y"]);
    }

    #[test]
    fn test_format_arguments_keep_existing_unattended() {
        assert_eq!(
            format_arguments("R:", "/fs:exfat /Y /q"),
            vec!["R:", "/fs:exfat", "/Y", "/q"]
        );
        assert_eq!(format_arguments("R:", "/y"), vec!["R:", "/y"]);
    }

    #[test]
    fn test_volume_root() {
        assert_eq!(volume_root("R:"), "R:\\");
        assert_eq!(volume_root("C:\\Mounts\\Ram"), "C:\\Mounts\\Ram");
    }
}
