//! Error types for GpuRamDrive

use gpuramdrive_shared::ChannelError;
use thiserror::Error;

/// Backend memory could not be allocated or the runtime is missing
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Not enough device or host memory for the requested size
    #[error("not enough memory to allocate {requested} bytes{}", free_suffix(.free))]
    OutOfMemory {
        /// Requested size in bytes
        requested: u64,
        /// Free bytes reported by the device, when known
        free: Option<u64>,
    },

    /// The vendor runtime library could not be loaded
    #[error("{api} runtime is not available: {reason}")]
    RuntimeUnavailable {
        /// "OpenCL" or "CUDA"
        api: &'static str,
        /// Loader error
        reason: String,
    },

    /// A runtime call failed
    #[error("{call} failed with error code {code}")]
    Api {
        /// Name of the failing call
        call: &'static str,
        /// Runtime error code
        code: i64,
    },

    /// Selector does not name an enumerated device
    #[error("no device at platform {platform}, index {device}")]
    NoSuchDevice {
        /// Platform index
        platform: usize,
        /// Device index within the platform
        device: usize,
    },
}

fn free_suffix(free: &Option<u64>) -> String {
    match free {
        Some(bytes) => format!(", free: {} MB", bytes / (1024 * 1024)),
        None => String::new(),
    }
}

/// The virtual disk driver rejected a request
#[derive(Debug, Error)]
pub enum DriverError {
    /// Driver control library could not be loaded
    #[error("ImDisk is not available: {0}")]
    Unavailable(String),

    /// Device creation failed
    #[error("unable to create and mount ImDisk drive on '{mount_point}': error {code}")]
    CreateFailed {
        /// Requested mount point
        mount_point: String,
        /// OS error code
        code: u32,
    },

    /// Device removal failed
    #[error("unable to remove ImDisk device {device_id}: error {code}")]
    RemoveFailed {
        /// Driver-assigned device number
        device_id: u32,
        /// OS error code
        code: u32,
    },
}

/// Formatting or labelling the new volume failed
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The format utility could not be started
    #[error("unable to run format utility: {0}")]
    Spawn(#[from] std::io::Error),

    /// The format utility exited unsuccessfully
    #[error("format utility exited with {0}")]
    FormatFailed(String),

    /// Setting the volume label failed
    #[error("unable to set volume label on '{mount_point}': error {code}")]
    Label {
        /// Mount point of the volume
        mount_point: String,
        /// OS error code
        code: u32,
    },

    /// Operation has no implementation on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

/// Reading or writing the user environment failed
#[derive(Debug, Error)]
pub enum EnvironmentError {
    /// Temp folder could not be created
    #[error("unable to create temp folder: {0}")]
    Io(#[from] std::io::Error),

    /// Environment store rejected the update
    #[error("unable to update environment variable '{name}': error {code}")]
    Store {
        /// Variable name
        name: String,
        /// OS error code
        code: u32,
    },
}

/// Errors surfaced by the drive lifecycle controller
#[derive(Debug, Error)]
pub enum DriveError {
    /// Backend allocation failed
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),

    /// Shared memory channel setup failed
    #[error("channel setup failed: {0}")]
    Channel(#[from] ChannelError),

    /// Driver refused to register the device
    #[error("device registration failed: {0}")]
    DeviceRegistration(#[source] DriverError),

    /// Descriptor is unusable (empty service name, zero size, ...)
    #[error("invalid drive descriptor: {0}")]
    InvalidDescriptor(String),

    /// Worker thread could not be spawned
    #[error("unable to spawn drive worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// Worker exited before reporting whether setup succeeded
    #[error("drive worker exited during setup")]
    WorkerLost,
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, DriveError>;
