//! Drive lifecycle controller
//!
//! A [`RamDrive`] owns at most one worker thread. The worker allocates the
//! backend, creates the shared memory channel, reports back over a one-shot
//! handshake and then serves the driver until the device is closed. The
//! controller registers the device with the driver only after the handshake
//! says the channel is live.
//!
//! ```text
//! Idle -> Allocating -> Serving -> Unmounting -> Idle
//!             |
//!             +-> Error
//! ```

use crate::backend::{self, BackendKind, BackendSelector, MemoryBackend};
use crate::config::{DriveDescriptor, FormatOptions};
use crate::driver::{AUTO_DEVICE_NUMBER, DeviceRegistration, VirtualDiskDriver};
use crate::environment::{self, EnvironmentStore, TempRedirect};
use crate::error::{DriveError, Result};
use crate::server::{self, ServeExit};
use crate::volume::{SystemVolumeTools, VolumeTools};
use gpuramdrive_shared::{Namespace, ProxyChannel, Signal};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where the drive is in its lifecycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DriveState {
    #[default]
    Idle,
    Allocating,
    Serving,
    Unmounting,
    /// Last create failed
    Error(String),
}

/// Which thread asked for a teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOrigin {
    /// The drive worker itself (e.g. from a state-change callback)
    Worker,
    /// Any other thread
    External,
}

thread_local! {
    static ON_DRIVE_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Origin of a teardown requested on the current thread
pub fn teardown_origin() -> TeardownOrigin {
    if ON_DRIVE_WORKER.with(Cell::get) {
        TeardownOrigin::Worker
    } else {
        TeardownOrigin::External
    }
}

type StateCallback = Arc<dyn Fn() + Send + Sync>;

/// State visible to both the controller and the worker
#[derive(Default)]
struct DriveShared {
    state: Mutex<DriveState>,
    mapped: AtomicBool,
    on_state_change: Mutex<Option<StateCallback>>,
}

impl DriveShared {
    fn state(&self) -> MutexGuard<'_, DriveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: DriveState) {
        debug!(?state, "drive state");
        *self.state() = state;
    }

    /// Back to idle unless a failure is being reported
    fn settle(&self) {
        let mut state = self.state();
        if !matches!(*state, DriveState::Error(_)) {
            *state = DriveState::Idle;
        }
    }

    fn notify(&self) {
        // clone out so the callback runs without the lock held
        let callback = self
            .on_state_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Wakes the serve loop between requests and asks it to return
struct StopHandle {
    flag: Arc<AtomicBool>,
    request: Arc<dyn Signal>,
}

impl StopHandle {
    fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.request.set() {
            warn!(error = %e, "unable to wake drive worker");
        }
    }
}

struct DriveWorker {
    join: JoinHandle<()>,
    stop: StopHandle,
}

impl DriveWorker {
    fn join(self) {
        if self.join.join().is_err() {
            error!("drive worker panicked");
        }
    }
}

/// What the worker needs to bring a drive up
struct WorkerSetup {
    backend: BackendKind,
    selector: BackendSelector,
    size: u64,
    service_name: String,
    namespace: Arc<dyn Namespace>,
}

/// Backend and channel owned by the worker
struct DriveResources {
    channel: Option<ProxyChannel>,
    backend: Option<Box<dyn MemoryBackend>>,
    shared: Arc<DriveShared>,
}

impl DriveResources {
    fn new(shared: Arc<DriveShared>) -> Self {
        Self {
            channel: None,
            backend: None,
            shared,
        }
    }

    /// Allocate the backend, then create the channel. Returns the request
    /// signal for the controller's stop handle.
    fn open(&mut self, setup: &WorkerSetup) -> Result<Arc<dyn Signal>> {
        info!(
            backend = %setup.backend,
            size = setup.size,
            "allocating drive memory"
        );
        self.backend = Some(backend::allocate(
            setup.backend,
            setup.selector,
            setup.size,
        )?);

        info!(service = %setup.service_name, "setting up proxy channel");
        let channel = ProxyChannel::setup(setup.namespace.as_ref(), &setup.service_name)?;
        let request = channel.request_signal().ok_or(DriveError::WorkerLost)?;
        self.channel = Some(channel);
        self.shared.mapped.store(true, Ordering::SeqCst);
        Ok(request)
    }

    fn serve(&mut self, stop: &AtomicBool) -> Option<ServeExit> {
        let channel = self.channel.as_mut()?;
        let backend = self.backend.as_mut()?;
        Some(server::serve(channel, &mut **backend, stop))
    }

    /// Release channel and backend. Safe to call more than once; always
    /// notifies.
    fn close(&mut self) {
        self.shared.mapped.store(false, Ordering::SeqCst);
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(backend) = self.backend.take() {
            debug!(kind = %backend.kind(), "releasing drive memory");
            drop(backend);
        }
        self.shared.settle();
        self.shared.notify();
    }
}

fn run_worker(
    setup: WorkerSetup,
    shared: Arc<DriveShared>,
    stop: Arc<AtomicBool>,
    handshake: SyncSender<Result<Arc<dyn Signal>>>,
) {
    ON_DRIVE_WORKER.with(|flag| flag.set(true));

    let mut resources = DriveResources::new(Arc::clone(&shared));
    match resources.open(&setup) {
        Ok(request) => {
            shared.set_state(DriveState::Serving);
            if handshake.send(Ok(request)).is_err() {
                resources.close();
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "drive setup failed");
            shared.set_state(DriveState::Error(e.to_string()));
            resources.close();
            let _ = handshake.send(Err(e));
            return;
        }
    }

    match resources.serve(&stop) {
        Some(ServeExit::Closed) => info!("driver closed the device"),
        Some(ServeExit::Stopped) => debug!("serve loop stopped"),
        Some(ServeExit::WaitFailed(e)) => warn!(error = %e, "waiting for requests failed"),
        Some(ServeExit::SignalFailed(e)) => warn!(error = %e, "signalling a response failed"),
        Some(ServeExit::ChannelClosed) => warn!("proxy channel closed while serving"),
        None => {}
    }
    resources.close();
}

/// A recorded mount
struct Mount {
    mount_point: String,
    device_id: u32,
    temp_redirect: Option<TempRedirect>,
}

/// A virtual disk backed by host or GPU memory
pub struct RamDrive {
    driver: Arc<dyn VirtualDiskDriver>,
    namespace: Arc<dyn Namespace>,
    volume_tools: Arc<dyn VolumeTools>,
    environment: Arc<dyn EnvironmentStore>,
    shared: Arc<DriveShared>,
    worker: Option<DriveWorker>,
    mount: Option<Mount>,
    descriptor: Option<DriveDescriptor>,
}

impl RamDrive {
    pub fn new(driver: Arc<dyn VirtualDiskDriver>, namespace: Arc<dyn Namespace>) -> Self {
        Self {
            driver,
            namespace,
            volume_tools: Arc::new(SystemVolumeTools),
            environment: Arc::from(environment::default_store()),
            shared: Arc::default(),
            worker: None,
            mount: None,
            descriptor: None,
        }
    }

    pub fn with_volume_tools(mut self, tools: Arc<dyn VolumeTools>) -> Self {
        self.volume_tools = tools;
        self
    }

    pub fn with_environment(mut self, store: Arc<dyn EnvironmentStore>) -> Self {
        self.environment = store;
        self
    }

    /// Called after every create, refused create and close.
    ///
    /// May run on the drive worker thread, so it must not wait on anything
    /// the thread calling [`create`](Self::create) or
    /// [`unmount`](Self::unmount) holds.
    pub fn on_state_change(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self
            .shared
            .on_state_change
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn state(&self) -> DriveState {
        self.shared.state().clone()
    }

    /// Mounted and the shared section is still mapped
    pub fn is_mounted(&self) -> bool {
        self.mount.is_some() && self.shared.mapped.load(Ordering::SeqCst)
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.mount.as_ref().map(|m| m.mount_point.as_str())
    }

    /// Descriptor of the current mount
    pub fn descriptor(&self) -> Option<&DriveDescriptor> {
        self.descriptor.as_ref()
    }

    /// Allocate, serve and mount a drive.
    ///
    /// Returns without doing anything if a previous worker is still running.
    /// On error nothing is left behind: the worker has released its memory
    /// and channel, and any device the driver created is removed.
    pub fn create(&mut self, descriptor: DriveDescriptor) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            if !worker.join.is_finished() {
                warn!("previous drive is still shutting down, ignoring create");
                self.worker = Some(worker);
                self.shared.notify();
                return Ok(());
            }
            worker.join();
        }
        if self.mount.is_some() {
            // the driver closed the device but it was never unmounted
            self.unmount();
        }

        descriptor.validate()?;
        info!(
            mount_point = %descriptor.mount_point,
            drive_type = %descriptor.drive_type,
            backend = %descriptor.backend,
            size = descriptor.size,
            "creating drive"
        );
        self.shared.set_state(DriveState::Allocating);

        let worker = self.spawn_worker(&descriptor)?;

        let mut registration = DeviceRegistration::for_descriptor(&descriptor);
        if let Err(e) = self.driver.create_device(&mut registration) {
            error!(error = %e, "device registration failed");
            // set before the worker's close notifies, which keeps an Error
            self.shared.set_state(DriveState::Error(e.to_string()));
            worker.stop.stop();
            worker.join();
            if registration.device_id != AUTO_DEVICE_NUMBER {
                if let Err(e) = self.driver.force_remove_device(registration.device_id) {
                    warn!(error = %e, "unable to remove half-created device");
                }
            }
            return Err(DriveError::DeviceRegistration(e));
        }
        self.worker = Some(worker);

        let mut mount = Mount {
            mount_point: descriptor.mount_point.clone(),
            device_id: registration.device_id,
            temp_redirect: None,
        };
        info!(
            mount_point = %mount.mount_point,
            device_id = mount.device_id,
            "drive mounted"
        );

        if let Some(format) = &descriptor.format {
            self.prepare_volume(&mut mount, format);
        }

        self.mount = Some(mount);
        self.descriptor = Some(descriptor);
        self.shared.notify();
        Ok(())
    }

    fn spawn_worker(&self, descriptor: &DriveDescriptor) -> Result<DriveWorker> {
        let setup = WorkerSetup {
            backend: descriptor.backend,
            selector: descriptor.selector,
            size: descriptor.size,
            service_name: descriptor.service_name.clone(),
            namespace: Arc::clone(&self.namespace),
        };
        let shared = Arc::clone(&self.shared);
        let flag = Arc::new(AtomicBool::new(false));
        let worker_flag = Arc::clone(&flag);
        let (handshake, ready) = sync_channel(1);

        let join = std::thread::Builder::new()
            .name(format!("drive-{}", descriptor.service_name))
            .spawn(move || run_worker(setup, shared, worker_flag, handshake))
            .map_err(|e| {
                self.shared.set_state(DriveState::Error(e.to_string()));
                self.shared.notify();
                DriveError::Spawn(e)
            })?;

        let outcome = ready.recv();
        match outcome {
            Ok(Ok(request)) => Ok(DriveWorker {
                join,
                stop: StopHandle { flag, request },
            }),
            Ok(Err(e)) => {
                if join.join().is_err() {
                    error!("drive worker panicked");
                }
                Err(e)
            }
            Err(_) => {
                if join.join().is_err() {
                    error!("drive worker panicked");
                }
                self.shared
                    .set_state(DriveState::Error(DriveError::WorkerLost.to_string()));
                Err(DriveError::WorkerLost)
            }
        }
    }

    /// Format, label and temp redirection. Failures are logged; the drive
    /// stays mounted either way.
    fn prepare_volume(&self, mount: &mut Mount, format: &FormatOptions) {
        if let Err(e) = self.volume_tools.format(&mount.mount_point, &format.params) {
            warn!(error = %e, "formatting failed");
        }

        if let Some(label) = &format.label {
            if let Err(e) = self.volume_tools.set_label(&mount.mount_point, label) {
                warn!(error = %e, "setting volume label failed");
            }
        }

        if format.temp_folder {
            match TempRedirect::apply(self.environment.as_ref(), &mount.mount_point) {
                Ok(redirect) => mount.temp_redirect = Some(redirect),
                Err(e) => warn!(error = %e, "temp folder redirection failed"),
            }
        }
    }

    /// Remove the device and wait for the worker. Does nothing if no drive is
    /// mounted. Failures are logged, never returned.
    pub fn unmount(&mut self) {
        let Some(mount) = self.mount.take() else {
            return;
        };
        self.descriptor = None;
        self.shared.set_state(DriveState::Unmounting);

        if let Some(redirect) = &mount.temp_redirect {
            if let Err(e) = redirect.restore(self.environment.as_ref()) {
                warn!(error = %e, "restoring temp folder failed");
            }
        }

        info!(mount_point = %mount.mount_point, "unmounting drive");
        if let Err(e) = self.driver.force_remove_device(mount.device_id) {
            warn!(error = %e, "forced device removal failed");
        }

        match teardown_origin() {
            TeardownOrigin::External => {
                if let Some(worker) = self.worker.take() {
                    worker.stop.stop();
                    worker.join();
                }
            }
            TeardownOrigin::Worker => {
                debug!("unmount requested from the drive worker, not joining");
            }
        }

        self.shared.settle();
        info!(mount_point = %mount.mount_point, "drive unmounted");
    }
}

impl Drop for RamDrive {
    fn drop(&mut self) {
        self.unmount();
    }
}
