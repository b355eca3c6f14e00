//! Mount a drive and keep serving it until the user or the driver ends it

use colored::Colorize;
use gpuramdrive::DriveDescriptor;

#[cfg(windows)]
pub fn run(descriptor: DriveDescriptor) {
    use gpuramdrive::{ImDiskDriver, RamDrive};
    use gpuramdrive_shared::Win32Namespace;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::time::Duration;

    let driver = match ImDiskDriver::load() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("{} {}", "[ERROR]".red(), e);
            eprintln!("Make sure the ImDisk Virtual Disk Driver is installed.");
            return;
        }
    };

    let mut drive = RamDrive::new(Arc::new(driver), Arc::new(Win32Namespace));
    drive.on_state_change(|| tracing::debug!("drive state changed"));

    println!(
        "{} Creating {} drive on {} ({} bytes, {} memory)",
        "[INFO]".blue(),
        descriptor.drive_type,
        descriptor.mount_point,
        descriptor.size,
        descriptor.backend
    );
    let mount_point = descriptor.mount_point.clone();
    if let Err(e) = drive.create(descriptor) {
        eprintln!("{} {}", "[ERROR]".red(), e);
        return;
    }
    println!("{} Drive mounted on {}", "[OK]".green(), mount_point);
    println!("{} Press Enter to unmount", "[INFO]".blue());

    // stdin blocks, so read it on its own thread and keep an eye on the drive
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        let _ = tx.send(());
    });

    loop {
        if rx.try_recv().is_ok() {
            break;
        }
        if !drive.is_mounted() {
            println!("{} Drive was closed by the driver", "[WARN]".yellow());
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    drive.unmount();
    println!("{} Drive unmounted", "[OK]".green());
}

#[cfg(not(windows))]
pub fn run(descriptor: DriveDescriptor) {
    eprintln!(
        "{} Cannot mount {}: mounting needs Windows with the ImDisk driver installed",
        "[ERROR]".red(),
        descriptor.mount_point
    );
}
