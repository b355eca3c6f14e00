//! GpuRamDrive CLI - mounts a virtual disk held in GPU or host memory

mod mount;

use clap::Parser;
use colored::Colorize;
use gpuramdrive::{
    BackendKind, DEFAULT_SERVICE_NAME, DriveDescriptor, DriveType, FormatOptions, GpuDevice,
    list_devices, parse_size,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpuramdrive")]
#[command(about = "GpuRamDrive - RAM disk backed by GPU or host memory, served through ImDisk")]
#[command(version)]
struct Args {
    /// List the devices each backend can allocate on
    #[arg(short, long)]
    list: bool,

    /// Memory backend: host, opencl or cuda
    #[arg(short, long, default_value = "host")]
    backend: BackendKind,

    /// Device index as shown by --list
    #[arg(short, long, default_value_t = 0)]
    device: usize,

    /// Disk size, with an optional K/M/G/T suffix (e.g. 512M, 4G)
    #[arg(short, long, value_parser = parse_size)]
    size: Option<u64>,

    /// Drive letter or folder to mount on (e.g. R:)
    #[arg(short, long)]
    mount: Option<String>,

    /// Name of the shared memory objects used by ImDisk
    #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
    service: String,

    /// Device type: HD, FD, CD or RAW
    #[arg(long = "type", default_value = "HD")]
    drive_type: DriveType,

    /// Report the disk as removable media
    #[arg(long)]
    removable: bool,

    /// Format the volume with these format.com parameters (e.g. "/fs:ntfs /q")
    #[arg(short, long)]
    format: Option<String>,

    /// Volume label applied after formatting
    #[arg(long, requires = "format")]
    label: Option<String>,

    /// Point TEMP and TMP at a Temp folder on the formatted volume
    #[arg(long, requires = "format")]
    temp_folder: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose);
    print_banner();

    // Handle --list flag
    if args.list {
        list_devices_command();
        return;
    }

    let descriptor = match build_descriptor(&args) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red(), e);
            return;
        }
    };

    mount::run(descriptor);
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_banner() {
    println!();
    println!("{}", "GpuRamDrive".cyan().bold());
    println!("{}", "RAM disk in GPU or host memory".white());
    println!();
}

fn list_devices_command() {
    println!("{} Listing devices...\n", "[INFO]".blue());

    println!(
        "{:<8} {:<6} {:<50} {}",
        "Backend".cyan().bold(),
        "Index".cyan().bold(),
        "Name".cyan().bold(),
        "Memory".cyan().bold(),
    );
    println!("{}", "-".repeat(80));

    for kind in [BackendKind::Host, BackendKind::OpenCl, BackendKind::Cuda] {
        match list_devices(kind) {
            Ok(devices) if devices.is_empty() => {
                println!("{:<8} {}", kind, "no devices".dimmed());
            }
            Ok(devices) => {
                for (index, device) in devices.iter().enumerate() {
                    println!(
                        "{:<8} {:<6} {:<50} {}",
                        kind,
                        index,
                        device.name,
                        format_size(device.memory_size)
                    );
                }
            }
            Err(e) => {
                println!("{:<8} {}", kind, e.to_string().dimmed());
            }
        }
    }
}

/// Turn the command line into a drive descriptor
fn build_descriptor(args: &Args) -> Result<DriveDescriptor, String> {
    let size = args.size.ok_or("--size is required to mount a drive")?;
    let mount_point = args
        .mount
        .clone()
        .ok_or("--mount is required to mount a drive")?;

    let mut descriptor = DriveDescriptor::new(size, mount_point);
    descriptor.drive_type = args.drive_type;
    descriptor.removable = args.removable;
    descriptor.backend = args.backend;
    descriptor.service_name = args.service.clone();
    descriptor.format = args.format.as_ref().map(|params| FormatOptions {
        params: params.clone(),
        label: args.label.clone(),
        temp_folder: args.temp_folder,
    });

    if args.backend != BackendKind::Host {
        let devices = list_devices(args.backend).map_err(|e| e.to_string())?;
        descriptor.selector = select_device(&devices, args.device)?.selector;
    }

    Ok(descriptor)
}

fn select_device(devices: &[GpuDevice], index: usize) -> Result<&GpuDevice, String> {
    devices.get(index).ok_or_else(|| {
        format!(
            "no device at index {index} ({} found, see --list)",
            devices.len()
        )
    })
}

/// Human readable byte count
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
